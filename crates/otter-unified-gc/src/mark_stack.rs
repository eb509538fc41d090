//! Mark stack: batched gray worklists with a shared stealing pool
//!
//! Each marker owns a `WorkNodeHolder` with an input and an output batch.
//! Full output batches are published to the `WorkPool`; an exhausted
//! holder steals whole batches back. Batches move by value, so a batch is
//! only ever reachable from one owner at a time.

use crossbeam_deque::{Injector, Steal};
use crossbeam_utils::Backoff;
use std::sync::Arc;

use crate::value::TaggedValue;

/// A batch of gray references
#[derive(Debug)]
pub struct WorkNode {
    entries: Vec<TaggedValue>,
    capacity: usize,
}

impl WorkNode {
    /// Create an empty batch
    pub fn new(capacity: usize) -> Box<Self> {
        let capacity = capacity.max(1);
        Box::new(Self {
            entries: Vec::with_capacity(capacity),
            capacity,
        })
    }

    /// Push an entry; `false` if the batch is full
    pub fn push(&mut self, value: TaggedValue) -> bool {
        if self.entries.len() >= self.capacity {
            return false;
        }
        self.entries.push(value);
        true
    }

    /// Pop an entry
    pub fn pop(&mut self) -> Option<TaggedValue> {
        self.entries.pop()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the batch is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Shared pool of published batches
#[derive(Debug, Default)]
pub struct WorkPool {
    batches: Injector<Box<WorkNode>>,
}

impl WorkPool {
    /// Create an empty pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a batch
    pub fn push(&self, node: Box<WorkNode>) {
        if !node.is_empty() {
            self.batches.push(node);
        }
    }

    /// Publish a single reference (used by foreign threads)
    pub fn push_single(&self, value: TaggedValue) {
        let mut node = WorkNode::new(1);
        node.push(value);
        self.batches.push(node);
    }

    /// Take one batch
    pub fn steal(&self) -> Option<Box<WorkNode>> {
        let backoff = Backoff::new();
        loop {
            match self.batches.steal() {
                Steal::Success(node) => return Some(node),
                Steal::Empty => return None,
                Steal::Retry => backoff.spin(),
            }
        }
    }

    /// Whether no batch is published
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Drop every published batch
    pub fn clear(&self) -> usize {
        let mut dropped = 0;
        while let Some(node) = self.steal() {
            dropped += node.len();
        }
        dropped
    }
}

/// Per-marker view of the mark stack
pub struct WorkNodeHolder {
    pool: Arc<WorkPool>,
    in_node: Box<WorkNode>,
    out_node: Box<WorkNode>,
    capacity: usize,
}

impl WorkNodeHolder {
    /// Create a holder publishing into `pool`
    pub fn new(pool: Arc<WorkPool>, capacity: usize) -> Self {
        Self {
            pool,
            in_node: WorkNode::new(capacity),
            out_node: WorkNode::new(capacity),
            capacity,
        }
    }

    /// Push a gray reference
    pub fn push(&mut self, value: TaggedValue) {
        if !self.out_node.push(value) {
            let full = std::mem::replace(&mut self.out_node, WorkNode::new(self.capacity));
            self.pool.push(full);
            self.out_node.push(value);
        }
    }

    /// Pop a gray reference, stealing from the pool once local work runs out
    pub fn pop(&mut self) -> Option<TaggedValue> {
        loop {
            if let Some(value) = self.in_node.pop() {
                return Some(value);
            }
            if !self.out_node.is_empty() {
                std::mem::swap(&mut self.in_node, &mut self.out_node);
                continue;
            }
            self.in_node = self.pool.steal()?;
        }
    }

    /// Publish local work so other markers can steal it
    pub fn publish(&mut self) {
        for node in [&mut self.in_node, &mut self.out_node] {
            if !node.is_empty() {
                let full = std::mem::replace(node, WorkNode::new(self.capacity));
                self.pool.push(full);
            }
        }
    }

    /// Whether both local batches are empty
    pub fn is_local_empty(&self) -> bool {
        self.in_node.is_empty() && self.out_node.is_empty()
    }

    /// Discard local work
    pub fn reset(&mut self) {
        self.in_node = WorkNode::new(self.capacity);
        self.out_node = WorkNode::new(self.capacity);
    }
}
