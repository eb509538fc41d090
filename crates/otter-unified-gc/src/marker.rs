//! Unified GC marker
//!
//! One marker per heap. Markers of the same VM share a `WorkPool`, so a
//! marker that runs dry steals gray batches published by the others and the
//! group cooperatively finishes one global mark.
//!
//! Edges of XRef objects that point into the companion VM's heap are never
//! dereferenced here; they are handed to the companion.

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::cross_vm::StsVmInterface;
use crate::heap::{HeapRegistry, LocalHeap};
use crate::mark_stack::{WorkNodeHolder, WorkPool};
use crate::object::ObjectClass;
use crate::value::TaggedValue;

/// Worker id used for the daemon's own marking
pub const DAEMON_WORKER: u32 = 0;

/// Marker for one heap
pub struct UnifiedGcMarker {
    heap: Arc<LocalHeap>,
    heaps: Arc<HeapRegistry>,
    holder: Mutex<WorkNodeHolder>,
    initialized: AtomicBool,
    init_lock: Mutex<()>,
    /// Objects blackened since `initialize`
    marked: AtomicUsize,
}

impl UnifiedGcMarker {
    /// Create a marker for `heap` resolving references through `heaps`
    pub fn new(
        heap: Arc<LocalHeap>,
        heaps: Arc<HeapRegistry>,
        pool: Arc<WorkPool>,
        work_node_capacity: usize,
    ) -> Self {
        Self {
            heap,
            heaps,
            holder: Mutex::new(WorkNodeHolder::new(pool, work_node_capacity)),
            initialized: AtomicBool::new(false),
            init_lock: Mutex::new(()),
            marked: AtomicUsize::new(0),
        }
    }

    /// The heap this marker owns
    pub fn heap(&self) -> &Arc<LocalHeap> {
        &self.heap
    }

    /// Per-episode setup. Later calls in the same episode are no-ops.
    pub fn initialize(&self) {
        if self.initialized.load(Ordering::Acquire) {
            return;
        }
        let _guard = self.init_lock.lock();
        if self.initialized.load(Ordering::Acquire) {
            return;
        }
        self.heap.clear_marks();
        self.heap.set_marking(true);
        self.holder.lock().reset();
        self.marked.store(0, Ordering::Relaxed);
        self.initialized.store(true, Ordering::Release);
    }

    /// Whether `initialize` ran for the current episode
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Seed the mark stack from the heap's roots
    pub fn initial_mark(&self, worker: u32) {
        let roots = self.heap.roots().snapshot();
        let mut holder = self.holder.lock();
        for root in &roots {
            self.mark_value(&mut holder, *root);
        }
        tracing::trace!(
            target: "otter::gc",
            worker,
            heap = self.heap.id().0,
            roots = roots.len(),
            "initial mark"
        );
    }

    /// Gray `value` if it is an unmarked object of this VM.
    ///
    /// Returns `true` when this call did the marking.
    fn mark_value(&self, holder: &mut WorkNodeHolder, value: TaggedValue) -> bool {
        let Some(object) = self.heaps.resolve(value) else {
            return false;
        };
        if object.header().try_mark() {
            holder.push(value);
            true
        } else {
            false
        }
    }

    /// Drain the mark stack until this marker and the shared pool run dry.
    ///
    /// Returns the number of objects scanned.
    pub fn process_mark_stack(&self, worker: u32, companion: Option<&dyn StsVmInterface>) -> usize {
        let mut holder = self.holder.lock();
        for entry in self.heap.take_barrier_entries() {
            self.mark_value(&mut holder, entry);
        }

        let mut scanned = 0;
        while let Some(value) = holder.pop() {
            let Some(object) = self.heaps.resolve(value) else {
                continue;
            };
            object
                .body()
                .trace(&mut |field| {
                    self.mark_value(&mut holder, field);
                });
            if object.header().class() == ObjectClass::XRef {
                object.body().trace_xref(&mut |foreign| {
                    if let Some(companion) = companion
                        && foreign.is_heap_object()
                    {
                        companion.mark_from_object(foreign);
                    }
                });
            }
            object.header().blacken();
            scanned += 1;
        }
        self.marked.fetch_add(scanned, Ordering::Relaxed);
        tracing::trace!(target: "otter::gc", worker, heap = self.heap.id().0, scanned, "mark stack drained");
        scanned
    }

    /// Gray one object on behalf of another collector and publish it.
    ///
    /// The object's graph is traced by the next `process_mark_stack`.
    pub fn mark_from_object(&self, value: TaggedValue, pool: &WorkPool) -> bool {
        let Some(object) = self.heaps.resolve(value) else {
            return false;
        };
        if object.header().try_mark() {
            pool.push_single(value);
            true
        } else {
            false
        }
    }

    /// Objects scanned since `initialize`
    pub fn marked_count(&self) -> usize {
        self.marked.load(Ordering::Relaxed)
    }

    /// Per-episode teardown. Marks are left in place.
    pub fn finish(&self) {
        let _guard = self.init_lock.lock();
        self.holder.lock().reset();
        self.heap.set_marking(false);
        self.initialized.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for UnifiedGcMarker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnifiedGcMarker")
            .field("heap", &self.heap.id())
            .field("initialized", &self.is_initialized())
            .finish()
    }
}
