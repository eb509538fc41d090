//! Managed threads and the safepoint coordinator
//!
//! Every managed thread owns a local heap and a marker for it. A thread is
//! either executing managed code (`Running`), outside of it (`Native`), or
//! parked at a safepoint (`Suspended`). The coordinator may only mark while
//! no thread is `Running`.
//!
//! ## Handshake
//!
//! 1. The coordinator sets `suspend_requested` on every thread
//! 2. Running threads notice it at their next `check_safepoint` and park
//! 3. Native threads are already safe; they block when re-entering managed code
//! 4. Dropping the `SuspendAllScope` clears the request and wakes everyone

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use crate::heap::LocalHeap;
use crate::marker::UnifiedGcMarker;

/// Identifier of a managed thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(pub u32);

/// Scheduling state of a managed thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Executing managed code
    Running,
    /// Outside managed code; safe for GC
    Native,
    /// Parked at a safepoint
    Suspended,
}

struct ThreadInner {
    state: ThreadState,
    suspend_requested: bool,
    ready_for_gc: bool,
}

/// One managed execution context
pub struct JsThread {
    id: ThreadId,
    name: String,
    heap: Arc<LocalHeap>,
    marker: UnifiedGcMarker,
    inner: Mutex<ThreadInner>,
    changed: Condvar,
    /// Fast-path copy of `suspend_requested`
    poll: AtomicBool,
}

impl JsThread {
    pub(crate) fn new(id: ThreadId, name: String, heap: Arc<LocalHeap>, marker: UnifiedGcMarker) -> Self {
        Self {
            id,
            name,
            heap,
            marker,
            inner: Mutex::new(ThreadInner {
                state: ThreadState::Native,
                suspend_requested: false,
                ready_for_gc: false,
            }),
            changed: Condvar::new(),
            poll: AtomicBool::new(false),
        }
    }

    /// Thread id
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Thread name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The thread's local heap
    pub fn heap(&self) -> &Arc<LocalHeap> {
        &self.heap
    }

    /// Marker for the thread's local heap
    pub fn marker(&self) -> &UnifiedGcMarker {
        &self.marker
    }

    /// Current scheduling state
    pub fn state(&self) -> ThreadState {
        self.inner.lock().state
    }

    /// Whether the coordinator considers this thread parked for GC
    pub fn is_ready_for_gc(&self) -> bool {
        self.inner.lock().ready_for_gc
    }

    /// Enter managed code. Blocks while a suspension is pending.
    pub fn enter_managed(&self) -> ManagedScope<'_> {
        let mut inner = self.inner.lock();
        while inner.suspend_requested {
            self.changed.wait(&mut inner);
        }
        inner.state = ThreadState::Running;
        inner.ready_for_gc = false;
        ManagedScope { thread: self }
    }

    /// Safepoint poll. Parks the thread if a suspension is pending.
    #[inline]
    pub fn check_safepoint(&self) {
        if self.poll.load(Ordering::Acquire) {
            self.park();
        }
    }

    #[cold]
    fn park(&self) {
        let mut inner = self.inner.lock();
        if inner.state != ThreadState::Running || !inner.suspend_requested {
            return;
        }
        inner.state = ThreadState::Suspended;
        inner.ready_for_gc = true;
        self.changed.notify_all();
        while inner.suspend_requested {
            self.changed.wait(&mut inner);
        }
        inner.state = ThreadState::Running;
        inner.ready_for_gc = false;
    }

    /// Run `f` outside managed code, e.g. a blocking wait on the GC.
    pub fn blocking_native<R>(&self, f: impl FnOnce() -> R) -> R {
        let previous = self.leave_managed();
        let result = f();
        if previous == ThreadState::Running {
            std::mem::forget(self.enter_managed());
        }
        result
    }

    fn leave_managed(&self) -> ThreadState {
        let mut inner = self.inner.lock();
        let previous = inner.state;
        inner.state = ThreadState::Native;
        if inner.suspend_requested {
            inner.ready_for_gc = true;
        }
        self.changed.notify_all();
        previous
    }

    fn request_suspend(&self) {
        let mut inner = self.inner.lock();
        inner.suspend_requested = true;
        self.poll.store(true, Ordering::Release);
        if inner.state != ThreadState::Running {
            inner.ready_for_gc = true;
        }
    }

    /// Wait until the thread is not running managed code.
    ///
    /// Missing the timeout is logged and waiting continues: proceeding with
    /// a thread still mutating would corrupt the mark.
    fn wait_until_safe(&self, timeout: Duration) {
        let mut inner = self.inner.lock();
        while inner.state == ThreadState::Running {
            if self.changed.wait_for(&mut inner, timeout).timed_out()
                && inner.state == ThreadState::Running
            {
                tracing::error!(
                    target: "otter::gc",
                    thread = self.id.0,
                    name = %self.name,
                    timeout_ms = timeout.as_millis() as u64,
                    "thread missed safepoint; still waiting"
                );
            }
        }
        inner.ready_for_gc = true;
    }

    fn resume(&self) {
        let mut inner = self.inner.lock();
        inner.suspend_requested = false;
        inner.ready_for_gc = false;
        self.poll.store(false, Ordering::Release);
        self.changed.notify_all();
    }
}

impl std::fmt::Debug for JsThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsThread")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

/// RAII: the owning thread runs managed code until this drops
pub struct ManagedScope<'a> {
    thread: &'a JsThread,
}

impl ManagedScope<'_> {
    /// Safepoint poll on the owning thread
    pub fn check_safepoint(&self) {
        self.thread.check_safepoint();
    }
}

impl Drop for ManagedScope<'_> {
    fn drop(&mut self) {
        self.thread.leave_managed();
    }
}

/// Registry of the managed threads of one VM
pub struct ThreadRegistry {
    threads: Mutex<Vec<Arc<JsThread>>>,
    next_id: AtomicU32,
    /// Last observed size, readable without the lock
    approximate_len: AtomicUsize,
    safepoint_timeout: Duration,
}

impl ThreadRegistry {
    /// Create an empty registry
    pub fn new(safepoint_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            threads: Mutex::new(Vec::new()),
            next_id: AtomicU32::new(1),
            approximate_len: AtomicUsize::new(0),
            safepoint_timeout,
        })
    }

    pub(crate) fn next_thread_id(&self) -> ThreadId {
        ThreadId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Add a thread. Blocks while a `SuspendAllScope` is alive.
    pub fn register(&self, thread: Arc<JsThread>) {
        let mut threads = self.threads.lock();
        threads.push(thread);
        self.approximate_len.store(threads.len(), Ordering::Relaxed);
    }

    /// Remove a thread. Blocks while a `SuspendAllScope` is alive.
    pub fn unregister(&self, id: ThreadId) -> Option<Arc<JsThread>> {
        let mut threads = self.threads.lock();
        let position = threads.iter().position(|thread| thread.id() == id)?;
        let thread = threads.remove(position);
        self.approximate_len.store(threads.len(), Ordering::Relaxed);
        Some(thread)
    }

    /// Call `f` once per registered thread
    pub fn gc_iterate_thread_list(&self, mut f: impl FnMut(&Arc<JsThread>)) {
        for thread in self.threads.lock().iter() {
            f(thread);
        }
    }

    /// Thread count, possibly stale. Only good for sizing buffers.
    pub fn approximate_thread_list_size(&self) -> usize {
        self.approximate_len.load(Ordering::Relaxed)
    }

    /// Suspend every registered thread until the scope drops.
    ///
    /// Registration and unregistration block for the scope's lifetime.
    pub fn suspend_all(&self) -> SuspendAllScope<'_> {
        let threads = self.threads.lock();
        for thread in threads.iter() {
            thread.request_suspend();
        }
        for thread in threads.iter() {
            thread.wait_until_safe(self.safepoint_timeout);
        }
        tracing::debug!(target: "otter::gc", threads = threads.len(), "all threads suspended");
        SuspendAllScope { threads }
    }
}

/// While alive, no registered thread executes managed code.
pub struct SuspendAllScope<'a> {
    threads: MutexGuard<'a, Vec<Arc<JsThread>>>,
}

impl SuspendAllScope<'_> {
    /// The suspended threads
    pub fn threads(&self) -> &[Arc<JsThread>] {
        &self.threads
    }
}

impl Drop for SuspendAllScope<'_> {
    fn drop(&mut self) {
        for thread in self.threads.iter() {
            thread.resume();
        }
        tracing::debug!(target: "otter::gc", threads = self.threads.len(), "threads resumed");
    }
}
