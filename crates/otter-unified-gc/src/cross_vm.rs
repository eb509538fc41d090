//! Cross-VM capability link
//!
//! Two VMs in one process can share object references. Each side exposes a
//! capability object to the other, exchanged exactly once by
//! [`CrossVmOperator::do_handshake`]. Only one companion can ever be linked.

use crossbeam_channel::bounded;
use std::sync::{Arc, OnceLock};

use crate::daemon::{DaemonHandle, DaemonTask};
use crate::error::{GcError, GcResult};
use crate::heap::HeapRegistry;
use crate::unified::{UnifiedGc, UnifiedGcOutcome};
use crate::value::TaggedValue;

/// Zero-argument quiescence check. The companion may call it repeatedly,
/// from any of its threads, while it polls.
pub type QuiescencePredicate<'a> = &'a (dyn Fn() -> bool + Sync);

/// What the companion VM exposes to this VM's collector.
///
/// Each barrier that takes a predicate returns once the companion is
/// quiescent and `predicate()` held, or early when it gives up; the return
/// value reports which.
pub trait StsVmInterface: Send + Sync {
    /// Begin the cross-VM GC. `false` means the companion refused.
    fn start_xgc_barrier(&self, predicate: QuiescencePredicate<'_>) -> bool;

    /// End the cross-VM GC
    fn finish_xgc_barrier(&self);

    /// Run the companion's concurrent mark until quiescent
    fn wait_for_concurrent_mark(&self, predicate: QuiescencePredicate<'_>) -> bool;

    /// Switch the companion to remark
    fn remark_start_barrier(&self);

    /// Run the companion's remark until quiescent
    fn wait_for_remark(&self, predicate: QuiescencePredicate<'_>) -> bool;

    /// Mark an object of the companion's heap reached from one of ours
    fn mark_from_object(&self, value: TaggedValue);
}

/// What this VM exposes to the companion.
pub trait EcmaVmInterface: Send + Sync {
    /// Run a unified GC mark on this VM. Callable from any thread except
    /// this VM's daemon. Returns whether the mark ran to completion.
    fn start_xref_marking(&self) -> bool;

    /// Ask the running unified GC, if any, to stop early
    fn notify_xgc_interruption(&self);

    /// Mark an object of this VM's heap reached from the companion
    fn mark_from_object(&self, value: TaggedValue);

    /// Whether the object was marked by the current or last mark
    fn is_object_alive(&self, value: TaggedValue) -> bool;

    /// Whether the value addresses an allocated object of this VM
    fn is_valid_heap_object(&self, value: TaggedValue) -> bool;
}

/// This VM's implementation of [`EcmaVmInterface`]
pub struct EcmaVmInterfaceImpl {
    daemon: DaemonHandle,
    gc: Arc<UnifiedGc>,
    heaps: Arc<HeapRegistry>,
}

impl EcmaVmInterfaceImpl {
    pub(crate) fn new(daemon: DaemonHandle, gc: Arc<UnifiedGc>, heaps: Arc<HeapRegistry>) -> Self {
        Self { daemon, gc, heaps }
    }
}

impl EcmaVmInterface for EcmaVmInterfaceImpl {
    fn start_xref_marking(&self) -> bool {
        let (reply, result) = bounded(1);
        if self.daemon.post_task(DaemonTask::UnifiedGcMark { reply }).is_err() {
            tracing::warn!(target: "otter::gc", "xref marking requested after daemon shutdown");
            return false;
        }
        match result.recv() {
            Ok(Ok(UnifiedGcOutcome::Completed)) => true,
            Ok(Ok(UnifiedGcOutcome::Interrupted)) => false,
            Ok(Err(error)) => {
                tracing::warn!(target: "otter::gc", %error, "xref marking did not start");
                false
            }
            Err(_) => false,
        }
    }

    fn notify_xgc_interruption(&self) {
        self.gc.request_interrupt();
    }

    fn mark_from_object(&self, value: TaggedValue) {
        if value.is_heap_object() {
            self.gc.mark_from_object(value);
        }
    }

    fn is_object_alive(&self, value: TaggedValue) -> bool {
        value
            .as_object_ref()
            .is_some_and(|r| self.heaps.is_alive(r))
    }

    fn is_valid_heap_object(&self, value: TaggedValue) -> bool {
        value
            .as_object_ref()
            .is_some_and(|r| self.heaps.contain_object(r))
    }
}

/// Owns this VM's interface and the link to the companion
pub struct CrossVmOperator {
    this_interface: Arc<EcmaVmInterfaceImpl>,
    companion: OnceLock<Arc<dyn StsVmInterface>>,
    gc: Arc<UnifiedGc>,
}

impl CrossVmOperator {
    pub(crate) fn new(this_interface: EcmaVmInterfaceImpl, gc: Arc<UnifiedGc>) -> Self {
        Self {
            this_interface: Arc::new(this_interface),
            companion: OnceLock::new(),
            gc,
        }
    }

    /// Link `companion` to `vm` and return `vm`'s own interface.
    ///
    /// Runs once per VM, during single-threaded startup. The companion is
    /// also registered with the VM's unified GC if none is registered there.
    pub fn do_handshake(
        vm: &crate::vm::EcmaVm,
        companion: Arc<dyn StsVmInterface>,
    ) -> GcResult<Arc<dyn EcmaVmInterface>> {
        vm.cross_vm_operator().link(companion)
    }

    fn link(&self, companion: Arc<dyn StsVmInterface>) -> GcResult<Arc<dyn EcmaVmInterface>> {
        if self.companion.set(companion.clone()).is_err() {
            return Err(GcError::HandshakeAlreadyDone);
        }
        if self.gc.companion().is_none() {
            self.gc.set_companion(companion);
        }
        tracing::debug!(target: "otter::gc", "cross-VM handshake done");
        Ok(self.this_interface.clone())
    }

    /// The linked companion, if any
    pub fn companion(&self) -> Option<&Arc<dyn StsVmInterface>> {
        self.companion.get()
    }

    /// This VM's interface
    pub fn interface(&self) -> Arc<dyn EcmaVmInterface> {
        self.this_interface.clone()
    }

    /// Mark `value` and, transitively, its graph. No-op for immediates.
    pub fn mark_from_object(&self, value: TaggedValue) {
        self.this_interface.mark_from_object(value);
    }

    /// Whether `value` was marked by the current or last mark
    pub fn is_object_alive(&self, value: TaggedValue) -> bool {
        self.this_interface.is_object_alive(value)
    }

    /// Whether `value` addresses an allocated object of this VM
    pub fn is_valid_heap_object(&self, value: TaggedValue) -> bool {
        self.this_interface.is_valid_heap_object(value)
    }

    /// See [`EcmaVmInterface::start_xref_marking`]
    pub fn start_xref_marking(&self) -> bool {
        self.this_interface.start_xref_marking()
    }

    /// See [`EcmaVmInterface::notify_xgc_interruption`]
    pub fn notify_xgc_interruption(&self) {
        self.this_interface.notify_xgc_interruption();
    }
}
