//! The VM container: heaps, threads, daemon and cross-VM link of one VM

use crossbeam_channel::bounded;
use std::sync::Arc;

use crate::config::GcConfig;
use crate::cross_vm::{CrossVmOperator, EcmaVmInterface, EcmaVmInterfaceImpl, StsVmInterface};
use crate::daemon::{DaemonTask, DaemonThread};
use crate::error::{GcError, GcResult};
use crate::heap::{HeapKind, HeapRegistry, LocalHeap};
use crate::mark_stack::WorkPool;
use crate::marker::UnifiedGcMarker;
use crate::thread::{JsThread, ThreadRegistry};
use crate::unified::{CollectionStats, UnifiedGc, UnifiedGcOutcome};

/// One VM instance
pub struct EcmaVm {
    config: GcConfig,
    heaps: Arc<HeapRegistry>,
    shared_heap: Arc<LocalHeap>,
    threads: Arc<ThreadRegistry>,
    pool: Arc<WorkPool>,
    gc: Arc<UnifiedGc>,
    operator: CrossVmOperator,
    daemon: DaemonThread,
}

impl EcmaVm {
    /// Create a VM and start its daemon
    pub fn new(config: GcConfig) -> GcResult<Self> {
        let heaps = HeapRegistry::new();
        let shared_heap = LocalHeap::new(HeapKind::Shared, config.heap_capacity);
        heaps.register(shared_heap.clone());
        let threads = ThreadRegistry::new(config.safepoint_timeout());
        let pool = Arc::new(WorkPool::new());
        let gc = Arc::new(UnifiedGc::new(
            config.clone(),
            heaps.clone(),
            threads.clone(),
            shared_heap.clone(),
            pool.clone(),
        ));
        let daemon = DaemonThread::spawn("otter-gc-daemon", gc.clone(), config.sweep_after_collection)?;
        let operator = CrossVmOperator::new(
            EcmaVmInterfaceImpl::new(daemon.handle(), gc.clone(), heaps.clone()),
            gc.clone(),
        );
        tracing::debug!(target: "otter::gc", shared_heap = shared_heap.id().0, "VM created");

        Ok(Self {
            config,
            heaps,
            shared_heap,
            threads,
            pool,
            gc,
            operator,
            daemon,
        })
    }

    /// Create a VM with default configuration
    pub fn with_defaults() -> GcResult<Self> {
        Self::new(GcConfig::default())
    }

    /// Create and register a managed thread with its own local heap
    pub fn create_thread(&self, name: impl Into<String>) -> Arc<JsThread> {
        let heap = LocalHeap::new(HeapKind::Local, self.config.heap_capacity);
        self.heaps.register(heap.clone());
        let marker = UnifiedGcMarker::new(
            heap.clone(),
            self.heaps.clone(),
            self.pool.clone(),
            self.config.work_node_capacity,
        );
        let thread = Arc::new(JsThread::new(
            self.threads.next_thread_id(),
            name.into(),
            heap,
            marker,
        ));
        self.threads.register(thread.clone());
        tracing::debug!(target: "otter::gc", thread = thread.id().0, "thread created");
        thread
    }

    /// Unregister a thread and drop its local heap
    pub fn destroy_thread(&self, thread: &JsThread) {
        if self.threads.unregister(thread.id()).is_some() {
            self.heaps.unregister(thread.heap().id());
            tracing::debug!(target: "otter::gc", thread = thread.id().0, "thread destroyed");
        }
    }

    /// Run a full collection on the daemon and wait for it.
    ///
    /// A caller executing managed code must wrap this in
    /// [`JsThread::blocking_native`], or the episode cannot suspend it.
    pub fn collect_garbage(&self) -> GcResult<CollectionStats> {
        let (reply, result) = bounded(1);
        self.daemon.post_task(DaemonTask::CollectGarbage { reply })?;
        result.recv().map_err(|_| GcError::DaemonStopped)?
    }

    /// Run a unified mark (no sweep) on the daemon and wait for it
    pub fn unified_gc_mark(&self) -> GcResult<UnifiedGcOutcome> {
        let (reply, result) = bounded(1);
        self.daemon.post_task(DaemonTask::UnifiedGcMark { reply })?;
        result.recv().map_err(|_| GcError::DaemonStopped)?
    }

    /// Link a companion VM. See [`CrossVmOperator::do_handshake`].
    pub fn do_handshake(&self, companion: Arc<dyn StsVmInterface>) -> GcResult<Arc<dyn EcmaVmInterface>> {
        CrossVmOperator::do_handshake(self, companion)
    }

    /// Configuration
    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    /// Every heap of this VM
    pub fn heaps(&self) -> &Arc<HeapRegistry> {
        &self.heaps
    }

    /// The shared heap
    pub fn shared_heap(&self) -> &Arc<LocalHeap> {
        &self.shared_heap
    }

    /// Managed threads
    pub fn threads(&self) -> &Arc<ThreadRegistry> {
        &self.threads
    }

    /// The unified GC controller
    pub fn unified_gc(&self) -> &Arc<UnifiedGc> {
        &self.gc
    }

    /// The cross-VM operator
    pub fn cross_vm_operator(&self) -> &CrossVmOperator {
        &self.operator
    }

    /// The daemon thread
    pub fn daemon(&self) -> &DaemonThread {
        &self.daemon
    }
}

impl Drop for EcmaVm {
    fn drop(&mut self) {
        self.daemon.terminate();
    }
}

impl std::fmt::Debug for EcmaVm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EcmaVm")
            .field("shared_heap", &self.shared_heap.id())
            .field("threads", &self.threads.approximate_thread_list_size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::RecordObject;

    #[test]
    fn test_create_and_destroy_thread() {
        let vm = EcmaVm::with_defaults().unwrap();
        let thread = vm.create_thread("main");
        assert!(vm.heaps().heap(thread.heap().id()).is_some());
        vm.destroy_thread(&thread);
        assert!(vm.heaps().heap(thread.heap().id()).is_none());
        assert_eq!(vm.threads().approximate_thread_list_size(), 0);
    }

    #[test]
    fn test_collect_garbage_sweeps_unreachable() {
        let vm = EcmaVm::with_defaults().unwrap();
        let thread = vm.create_thread("main");
        let heap = thread.heap();
        let live = heap.allocate(Box::new(RecordObject::default())).unwrap();
        let dead = heap.allocate(Box::new(RecordObject::default())).unwrap();
        let _root = heap.root(live);

        let stats = vm.collect_garbage().unwrap();
        assert_eq!(stats.outcome, UnifiedGcOutcome::Completed);
        assert_eq!(stats.swept.freed_objects, 1);
        assert!(heap.contain_object(live.as_object_ref().unwrap()));
        assert!(!heap.contain_object(dead.as_object_ref().unwrap()));
    }

    #[test]
    fn test_terminated_daemon_rejects_tasks() {
        let vm = EcmaVm::with_defaults().unwrap();
        assert!(vm.daemon().is_running());
        vm.daemon().terminate();
        assert!(!vm.daemon().is_running());
        assert!(matches!(vm.collect_garbage(), Err(GcError::DaemonStopped)));
    }
}
