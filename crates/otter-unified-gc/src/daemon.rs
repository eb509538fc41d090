//! Daemon thread
//!
//! Every unified GC episode runs here, one at a time, in the order the
//! requests were posted.

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::error::{GcError, GcResult};
use crate::unified::{CollectionStats, UnifiedGc, UnifiedGcOutcome};

/// Work the daemon performs
#[derive(Debug)]
pub enum DaemonTask {
    /// Run a unified mark and report its outcome
    UnifiedGcMark {
        /// Receives the outcome
        reply: Sender<GcResult<UnifiedGcOutcome>>,
    },
    /// Run a unified mark, then sweep if it completed
    CollectGarbage {
        /// Receives the episode stats
        reply: Sender<GcResult<CollectionStats>>,
    },
    /// Stop the daemon
    Terminate,
}

/// Cloneable sender side of the daemon's queue
#[derive(Debug, Clone)]
pub struct DaemonHandle {
    sender: Sender<DaemonTask>,
}

impl DaemonHandle {
    /// Queue a task
    pub fn post_task(&self, task: DaemonTask) -> GcResult<()> {
        self.sender.send(task).map_err(|_| GcError::DaemonStopped)
    }
}

/// The background thread owning the shared heap's collection
pub struct DaemonThread {
    handle: DaemonHandle,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl DaemonThread {
    /// Spawn the daemon for `gc`
    pub fn spawn(name: &str, gc: Arc<UnifiedGc>, sweep_after_collection: bool) -> GcResult<Self> {
        let (sender, receiver) = unbounded();
        let join = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run(receiver, gc, sweep_after_collection))?;
        tracing::debug!(target: "otter::gc", name, "daemon thread started");
        Ok(Self {
            handle: DaemonHandle { sender },
            join: Mutex::new(Some(join)),
        })
    }

    /// Queue a task
    pub fn post_task(&self, task: DaemonTask) -> GcResult<()> {
        self.handle.post_task(task)
    }

    /// A sender for other components
    pub fn handle(&self) -> DaemonHandle {
        self.handle.clone()
    }

    /// Whether the thread is still running
    pub fn is_running(&self) -> bool {
        self.join
            .lock()
            .as_ref()
            .is_some_and(|join| !join.is_finished())
    }

    /// Stop the daemon after the tasks already queued and wait for it
    pub fn terminate(&self) {
        let Some(join) = self.join.lock().take() else {
            return;
        };
        let _ = self.handle.post_task(DaemonTask::Terminate);
        if join.join().is_err() {
            tracing::error!(target: "otter::gc", "daemon thread panicked");
        }
    }
}

impl Drop for DaemonThread {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn run(receiver: Receiver<DaemonTask>, gc: Arc<UnifiedGc>, sweep_after_collection: bool) {
    while let Ok(task) = receiver.recv() {
        tracing::debug!(target: "otter::gc", ?task, "daemon task");
        match task {
            DaemonTask::UnifiedGcMark { reply } => {
                let _ = reply.send(gc.run_phases());
            }
            DaemonTask::CollectGarbage { reply } => {
                let _ = reply.send(gc.run_episode(sweep_after_collection));
            }
            DaemonTask::Terminate => break,
        }
    }
    tracing::debug!(target: "otter::gc", "daemon thread stopped");
}
