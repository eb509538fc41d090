//! Unified GC controller
//!
//! Drives one stop-the-world mark across every heap of this VM and, when a
//! companion VM is linked, keeps the companion's concurrent mark and remark
//! in step with ours until neither side has work left.
//!
//! ## Phases
//!
//! ```text
//! Idle -> Prepare -> Initialize -> Mark -> Finish -> Idle
//! ```
//!
//! An interrupted episode skips the companion's finish barrier, keeps the
//! marks it made and frees nothing.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use crate::config::GcConfig;
use crate::cross_vm::{QuiescencePredicate, StsVmInterface};
use crate::error::{GcError, GcResult};
use crate::heap::{HeapRegistry, LocalHeap, SweepStats};
use crate::interrupt::InterruptToken;
use crate::mark_stack::WorkPool;
use crate::marker::{DAEMON_WORKER, UnifiedGcMarker};
use crate::thread::{JsThread, SuspendAllScope, ThreadRegistry};
use crate::value::TaggedValue;

/// Controller phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnifiedGcPhase {
    /// No episode running
    Idle,
    /// Suspending threads, quiescing local concurrent marks
    Prepare,
    /// Per-episode marker setup
    Initialize,
    /// Marking, including cross-VM reconciliation
    Mark,
    /// Teardown and waking waiters
    Finish,
}

/// How an episode ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnifiedGcOutcome {
    /// Every reachable object is marked
    Completed,
    /// Stopped early; marks are partial and must not drive a sweep
    Interrupted,
}

/// Result of one episode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectionStats {
    /// How the mark ended
    pub outcome: UnifiedGcOutcome,
    /// Objects scanned by the mark
    pub marked: usize,
    /// Sweep results; zero unless a completed mark was swept
    pub swept: SweepStats,
}

/// Cumulative controller statistics
#[derive(Debug, Clone, Default)]
pub struct UnifiedGcStats {
    /// Episodes started
    pub episodes: u64,
    /// Episodes that completed
    pub completed: u64,
    /// Episodes that were interrupted
    pub interrupted: u64,
    /// Objects scanned by the last episode
    pub last_marked: usize,
    /// Reconciliation rounds run by the last episode
    pub last_reconcile_rounds: usize,
    /// Duration of the last episode
    pub last_duration: Duration,
}

/// The unified GC controller of one VM
pub struct UnifiedGc {
    config: GcConfig,
    heaps: Arc<HeapRegistry>,
    threads: Arc<ThreadRegistry>,
    shared_heap: Arc<LocalHeap>,
    shared_marker: UnifiedGcMarker,
    pool: Arc<WorkPool>,
    companion: OnceLock<Arc<dyn StsVmInterface>>,
    interrupt: InterruptToken,
    running: AtomicBool,
    phase: Mutex<UnifiedGcPhase>,
    stats: Mutex<UnifiedGcStats>,
    finished_episodes: Mutex<u64>,
    episode_finished: Condvar,
}

/// Clears the running flag on every exit path
struct EpisodeGuard<'a>(&'a AtomicBool);

impl Drop for EpisodeGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl UnifiedGc {
    /// Create a controller over `heaps`, marking `shared_heap` itself
    pub fn new(
        config: GcConfig,
        heaps: Arc<HeapRegistry>,
        threads: Arc<ThreadRegistry>,
        shared_heap: Arc<LocalHeap>,
        pool: Arc<WorkPool>,
    ) -> Self {
        let shared_marker = UnifiedGcMarker::new(
            shared_heap.clone(),
            heaps.clone(),
            pool.clone(),
            config.work_node_capacity,
        );
        Self {
            config,
            heaps,
            threads,
            shared_heap,
            shared_marker,
            pool,
            companion: OnceLock::new(),
            interrupt: InterruptToken::new(),
            running: AtomicBool::new(false),
            phase: Mutex::new(UnifiedGcPhase::Idle),
            stats: Mutex::new(UnifiedGcStats::default()),
            finished_episodes: Mutex::new(0),
            episode_finished: Condvar::new(),
        }
    }

    /// Register the companion. Only the first registration takes effect.
    pub fn set_companion(&self, companion: Arc<dyn StsVmInterface>) -> bool {
        self.companion.set(companion).is_ok()
    }

    /// The registered companion
    pub fn companion(&self) -> Option<&Arc<dyn StsVmInterface>> {
        self.companion.get()
    }

    /// The episode interruption token
    pub fn interrupt_token(&self) -> &InterruptToken {
        &self.interrupt
    }

    /// Ask the running episode to stop. Returns `false` if none is running.
    pub fn request_interrupt(&self) -> bool {
        if !self.running.load(Ordering::Acquire) {
            return false;
        }
        self.interrupt.request();
        tracing::warn!(target: "otter::gc", "unified GC interruption requested");
        true
    }

    /// Whether an episode is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Current phase
    pub fn phase(&self) -> UnifiedGcPhase {
        *self.phase.lock()
    }

    /// Cumulative statistics
    pub fn stats(&self) -> UnifiedGcStats {
        self.stats.lock().clone()
    }

    /// Episodes finished so far, interrupted ones included
    pub fn finished_episodes(&self) -> u64 {
        *self.finished_episodes.lock()
    }

    /// Block until at least `count` episodes have finished
    pub fn wait_for_episodes(&self, count: u64) {
        let mut finished = self.finished_episodes.lock();
        while *finished < count {
            self.episode_finished.wait(&mut finished);
        }
    }

    /// Marker of the shared heap
    pub fn shared_marker(&self) -> &UnifiedGcMarker {
        &self.shared_marker
    }

    fn set_phase(&self, phase: UnifiedGcPhase) {
        *self.phase.lock() = phase;
        tracing::debug!(target: "otter::gc", ?phase, "unified GC phase");
    }

    /// Run one mark episode: Prepare, Initialize, Mark, Finish.
    ///
    /// Only the daemon thread runs episodes; see [`crate::DaemonTask`].
    pub(crate) fn run_phases(&self) -> GcResult<UnifiedGcOutcome> {
        Ok(self.run_episode(false)?.outcome)
    }

    /// Run one episode and, if it completed and `sweep` is set, sweep every
    /// heap before the threads resume.
    pub(crate) fn run_episode(&self, sweep: bool) -> GcResult<CollectionStats> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(GcError::EpisodeInProgress);
        }
        let _running = EpisodeGuard(&self.running);
        // A request that raced the end of the previous episode
        if self.interrupt.clear() {
            tracing::debug!(target: "otter::gc", "dropped interrupt left over from a finished episode");
        }
        let start = Instant::now();

        let scope = self.prepare();
        self.initialize(&scope);
        let (outcome, rounds) = self.mark(&scope);
        let marked = self.marked_count(&scope);
        let swept = if sweep && outcome == UnifiedGcOutcome::Completed {
            self.sweep(&scope)
        } else {
            SweepStats::default()
        };
        self.finish(&scope, outcome, marked, rounds, start.elapsed());
        drop(scope);

        Ok(CollectionStats {
            outcome,
            marked,
            swept,
        })
    }

    /// Suspend every thread and quiesce local concurrent work
    fn prepare(&self) -> SuspendAllScope<'_> {
        self.set_phase(UnifiedGcPhase::Prepare);
        let scope = self.threads.suspend_all();
        for heap in self.all_heaps(&scope) {
            if heap.is_concurrent_marking() {
                heap.reset_concurrent_marker();
            }
            heap.wait_running_task_finished();
        }
        scope
    }

    fn initialize(&self, scope: &SuspendAllScope<'_>) {
        self.set_phase(UnifiedGcPhase::Initialize);
        self.pool.clear();
        self.shared_marker.initialize();
        for thread in scope.threads() {
            thread.marker().initialize();
        }
    }

    /// Returns the outcome and the number of reconciliation rounds
    fn mark(&self, scope: &SuspendAllScope<'_>) -> (UnifiedGcOutcome, usize) {
        self.set_phase(UnifiedGcPhase::Mark);
        let threads = scope.threads();
        let companion = self.companion.get().map(|c| c.as_ref());

        self.shared_marker.initial_mark(DAEMON_WORKER);
        self.shared_marker.process_mark_stack(DAEMON_WORKER, companion);
        self.mark_local_heaps(threads, companion);
        self.drain(threads, companion);

        let Some(companion) = companion else {
            return (UnifiedGcOutcome::Completed, 0);
        };

        if self.interrupt.is_requested() {
            return (self.abort("before cross-VM barrier"), 0);
        }
        self.wait_local_tasks(threads);

        let predicate = || self.interrupt.is_requested() || self.is_quiescent(threads);
        if !companion.start_xgc_barrier(&predicate) {
            tracing::warn!(target: "otter::gc", "companion refused cross-VM barrier");
            return (self.abort("companion refused barrier"), 0);
        }

        let mut rounds = 0;
        if !self.reconcile(threads, companion, &mut rounds, |p| {
            companion.wait_for_concurrent_mark(p)
        }) {
            return (self.abort("during concurrent mark"), rounds);
        }

        companion.remark_start_barrier();
        if !self.reconcile(threads, companion, &mut rounds, |p| companion.wait_for_remark(p)) {
            return (self.abort("during remark"), rounds);
        }

        companion.finish_xgc_barrier();
        (UnifiedGcOutcome::Completed, rounds)
    }

    /// Alternate local drains with companion waits until both sides are
    /// quiescent in the same round. Returns `false` when interrupted.
    fn reconcile(
        &self,
        threads: &[Arc<JsThread>],
        companion: &dyn StsVmInterface,
        rounds: &mut usize,
        wait: impl Fn(QuiescencePredicate<'_>) -> bool,
    ) -> bool {
        let predicate = || self.interrupt.is_requested() || self.is_quiescent(threads);
        loop {
            if self.interrupt.is_requested() {
                return false;
            }
            *rounds += 1;
            let drained = self.drain(threads, Some(companion));

            let companion_done = wait(&predicate);
            if self.interrupt.is_requested() {
                return false;
            }
            if companion_done && self.is_quiescent(threads) {
                return true;
            }
            if drained == 0 && self.is_quiescent(threads) {
                std::thread::sleep(self.config.xgc_poll_interval());
            }
        }
    }

    fn abort(&self, at: &str) -> UnifiedGcOutcome {
        self.interrupt.clear();
        let discarded = self.pool.clear();
        tracing::warn!(target: "otter::gc", at, discarded, "unified GC interrupted");
        UnifiedGcOutcome::Interrupted
    }

    fn mark_local_heaps(&self, threads: &[Arc<JsThread>], companion: Option<&dyn StsVmInterface>) {
        if !self.config.parallel_marking || threads.len() < 2 {
            for thread in threads {
                thread.marker().initial_mark(thread.id().0);
                thread.marker().process_mark_stack(thread.id().0, companion);
            }
            return;
        }

        std::thread::scope(|s| {
            for thread in threads {
                let task = thread.heap().begin_task();
                let work = move || {
                    let _task = task;
                    thread.marker().initial_mark(thread.id().0);
                    thread.marker().process_mark_stack(thread.id().0, companion);
                };
                let spawned = std::thread::Builder::new()
                    .name(format!("otter-gc-mark-{}", thread.id().0))
                    .spawn_scoped(s, work);
                if let Err(error) = spawned {
                    tracing::warn!(target: "otter::gc", %error, "marking heap on the daemon instead");
                    thread.marker().initial_mark(thread.id().0);
                    thread.marker().process_mark_stack(thread.id().0, companion);
                }
            }
        });
    }

    /// Process mark stacks until the pool and every barrier buffer are empty.
    /// Returns the number of objects scanned.
    fn drain(&self, threads: &[Arc<JsThread>], companion: Option<&dyn StsVmInterface>) -> usize {
        let mut scanned = 0;
        loop {
            scanned += self.shared_marker.process_mark_stack(DAEMON_WORKER, companion);
            for thread in threads {
                scanned += thread.marker().process_mark_stack(thread.id().0, companion);
            }
            let barriers_empty = !self.shared_heap.has_barrier_entries()
                && threads.iter().all(|t| !t.heap().has_barrier_entries());
            if barriers_empty && self.pool.is_empty() {
                return scanned;
            }
        }
    }

    /// No task is touching a heap and no gray work is queued anywhere.
    ///
    /// Task counts are read before the pool: work published by a task is
    /// in the pool by the time that task stops counting.
    fn is_quiescent(&self, threads: &[Arc<JsThread>]) -> bool {
        let heaps_idle = std::iter::once(&self.shared_heap)
            .chain(threads.iter().map(|t| t.heap()))
            .all(|heap| heap.running_task_count() == 0 && !heap.has_barrier_entries());
        heaps_idle && self.pool.is_empty()
    }

    fn wait_local_tasks(&self, threads: &[Arc<JsThread>]) {
        for heap in std::iter::once(&self.shared_heap).chain(threads.iter().map(|t| t.heap())) {
            heap.wait_running_task_finished();
        }
    }

    /// Gray an object reported by the companion and queue its graph.
    ///
    /// Ignored when no episode is marking or the object is not ours.
    pub fn mark_from_object(&self, value: TaggedValue) -> bool {
        let Some(heap) = value.as_object_ref().and_then(|r| self.heaps.heap(r.heap)) else {
            return false;
        };
        if !heap.is_marking() {
            return false;
        }
        let _task = heap.begin_task();
        self.shared_marker.mark_from_object(value, &self.pool)
    }

    fn marked_count(&self, scope: &SuspendAllScope<'_>) -> usize {
        self.shared_marker.marked_count()
            + scope
                .threads()
                .iter()
                .map(|t| t.marker().marked_count())
                .sum::<usize>()
    }

    fn sweep(&self, scope: &SuspendAllScope<'_>) -> SweepStats {
        self.all_heaps(scope)
            .iter()
            .map(|heap| heap.sweep())
            .fold(SweepStats::default(), |acc, s| SweepStats {
                freed_objects: acc.freed_objects + s.freed_objects,
                freed_bytes: acc.freed_bytes + s.freed_bytes,
            })
    }

    fn all_heaps(&self, scope: &SuspendAllScope<'_>) -> Vec<Arc<LocalHeap>> {
        std::iter::once(self.shared_heap.clone())
            .chain(scope.threads().iter().map(|t| t.heap().clone()))
            .collect()
    }

    /// Tear down the episode and wake every waiter, on every outcome.
    fn finish(
        &self,
        scope: &SuspendAllScope<'_>,
        outcome: UnifiedGcOutcome,
        marked: usize,
        rounds: usize,
        elapsed: Duration,
    ) {
        self.set_phase(UnifiedGcPhase::Finish);
        self.shared_marker.finish();
        for thread in scope.threads() {
            thread.marker().finish();
        }
        self.pool.clear();
        self.interrupt.clear();

        {
            let mut stats = self.stats.lock();
            stats.episodes += 1;
            match outcome {
                UnifiedGcOutcome::Completed => stats.completed += 1,
                UnifiedGcOutcome::Interrupted => stats.interrupted += 1,
            }
            stats.last_marked = marked;
            stats.last_reconcile_rounds = rounds;
            stats.last_duration = elapsed;
        }

        tracing::info!(
            target: "otter::gc",
            ?outcome,
            marked,
            rounds,
            elapsed_us = elapsed.as_micros() as u64,
            "unified GC finished"
        );

        *self.phase.lock() = UnifiedGcPhase::Idle;
        let mut finished = self.finished_episodes.lock();
        *finished += 1;
        self.episode_finished.notify_all();
    }
}

impl std::fmt::Debug for UnifiedGc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnifiedGc")
            .field("phase", &self.phase())
            .field("companion", &self.companion.get().is_some())
            .finish()
    }
}
