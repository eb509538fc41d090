//! GC Heap management
//!
//! A `LocalHeap` is a slot arena owned by one managed thread (or, for the
//! shared heap, by the daemon). Slots are addressed by `ObjectRef`; freed
//! slots are recycled through a free list.

use parking_lot::{Condvar, Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use crate::error::{GcError, GcResult, fatal};
use crate::object::{GcRef, GcTraceable, HeapObject};
use crate::value::{HeapId, ObjectRef, TaggedValue};

static NEXT_HEAP_ID: AtomicU32 = AtomicU32::new(1);

fn next_heap_id() -> HeapId {
    let id = NEXT_HEAP_ID.fetch_add(1, Ordering::Relaxed);
    if id > u16::MAX as u32 {
        fatal("heap id space exhausted");
    }
    HeapId(id as u16)
}

/// Which role a heap plays in its VM
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapKind {
    /// Owned by one `JsThread`
    Local,
    /// Owned by the daemon; reachable from every thread
    Shared,
}

struct Slots {
    cells: Vec<Option<Arc<HeapObject>>>,
    free: Vec<u32>,
}

/// Result of sweeping one heap
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    /// Objects freed
    pub freed_objects: usize,
    /// Bytes freed (estimated)
    pub freed_bytes: usize,
}

/// One heap: slot arena, root set, barrier buffer and task accounting.
pub struct LocalHeap {
    id: HeapId,
    kind: HeapKind,
    capacity: usize,
    slots: RwLock<Slots>,
    live_objects: AtomicUsize,
    allocated_bytes: AtomicUsize,
    roots: RootSet,
    /// Values that became reachable while a mark was running
    barrier_buffer: Mutex<Vec<TaggedValue>>,
    /// Unified mark in progress: black allocation and barriers active
    marking: AtomicBool,
    /// A local (non-unified) concurrent mark is in flight
    concurrent_marking: AtomicBool,
    running_tasks: AtomicUsize,
    task_lock: Mutex<()>,
    task_finished: Condvar,
}

impl LocalHeap {
    /// Create a heap able to hold `capacity` live objects
    pub fn new(kind: HeapKind, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            id: next_heap_id(),
            kind,
            capacity,
            slots: RwLock::new(Slots {
                cells: Vec::new(),
                free: Vec::new(),
            }),
            live_objects: AtomicUsize::new(0),
            allocated_bytes: AtomicUsize::new(0),
            roots: RootSet::default(),
            barrier_buffer: Mutex::new(Vec::new()),
            marking: AtomicBool::new(false),
            concurrent_marking: AtomicBool::new(false),
            running_tasks: AtomicUsize::new(0),
            task_lock: Mutex::new(()),
            task_finished: Condvar::new(),
        })
    }

    /// Heap id
    pub fn id(&self) -> HeapId {
        self.id
    }

    /// Heap role
    pub fn kind(&self) -> HeapKind {
        self.kind
    }

    /// Allocate an object. While a mark is running the object is born black.
    pub fn allocate(&self, body: Box<dyn GcTraceable>) -> GcResult<TaggedValue> {
        let object = HeapObject::new(body);
        if self.marking.load(Ordering::Acquire) {
            object.header().blacken();
        }
        let size = object.header().size();
        let cell = Some(Arc::new(object));

        let mut slots = self.slots.write();
        let index = if let Some(index) = slots.free.pop() {
            slots.cells[index as usize] = cell;
            index
        } else {
            if slots.cells.len() >= self.capacity {
                return Err(GcError::HeapExhausted {
                    heap: self.id,
                    capacity: self.capacity,
                });
            }
            slots.cells.push(cell);
            (slots.cells.len() - 1) as u32
        };
        drop(slots);

        self.live_objects.fetch_add(1, Ordering::Relaxed);
        self.allocated_bytes.fetch_add(size, Ordering::Relaxed);
        Ok(TaggedValue::object(ObjectRef::new(self.id, index)))
    }

    /// Allocate and return a typed handle
    pub fn allocate_typed<T: GcTraceable>(&self, body: T) -> GcResult<GcRef<T>> {
        let value = self.allocate(Box::new(body))?;
        let reference = match value.as_object_ref() {
            Some(r) => r,
            None => unreachable!("allocate returns a reference"),
        };
        match self.get(reference).and_then(|cell| GcRef::new(reference, cell)) {
            Some(handle) => Ok(handle),
            None => unreachable!("freshly allocated object has the requested body type"),
        }
    }

    /// Look up a live slot
    pub fn get(&self, r: ObjectRef) -> Option<Arc<HeapObject>> {
        if r.heap != self.id {
            return None;
        }
        self.slots
            .read()
            .cells
            .get(r.index as usize)
            .and_then(|cell| cell.clone())
    }

    /// Whether `r` addresses an allocated object of this heap
    pub fn contain_object(&self, r: ObjectRef) -> bool {
        r.heap == self.id
            && self
                .slots
                .read()
                .cells
                .get(r.index as usize)
                .is_some_and(Option::is_some)
    }

    /// Whether `r` was marked by the current or last mark
    pub fn is_alive(&self, r: ObjectRef) -> bool {
        self.get(r).is_some_and(|object| object.header().is_marked())
    }

    /// Number of live (allocated, not yet swept) objects
    pub fn object_count(&self) -> usize {
        self.live_objects.load(Ordering::Relaxed)
    }

    /// Estimated bytes held by live objects
    pub fn allocated_bytes(&self) -> usize {
        self.allocated_bytes.load(Ordering::Relaxed)
    }

    /// Visit every allocated object
    pub fn for_each_object(&self, mut visitor: impl FnMut(ObjectRef, &HeapObject)) {
        let slots = self.slots.read();
        for (index, cell) in slots.cells.iter().enumerate() {
            if let Some(object) = cell {
                visitor(ObjectRef::new(self.id, index as u32), object);
            }
        }
    }

    /// Reset every mark to white
    pub fn clear_marks(&self) {
        self.for_each_object(|_, object| object.header().whiten());
    }

    /// Free every white object.
    ///
    /// Must only run after a completed mark; an interrupted mark leaves
    /// white objects that may still be reachable.
    pub fn sweep(&self) -> SweepStats {
        let mut stats = SweepStats::default();
        let mut slots = self.slots.write();
        let Slots { cells, free } = &mut *slots;
        for (index, cell) in cells.iter_mut().enumerate() {
            let dead = cell
                .as_ref()
                .is_some_and(|object| !object.header().is_marked());
            if dead {
                if let Some(object) = cell.take() {
                    stats.freed_objects += 1;
                    stats.freed_bytes += object.header().size();
                }
                free.push(index as u32);
            }
        }
        drop(slots);

        self.live_objects
            .fetch_sub(stats.freed_objects, Ordering::Relaxed);
        self.allocated_bytes
            .fetch_sub(stats.freed_bytes, Ordering::Relaxed);

        tracing::debug!(
            target: "otter::gc",
            heap = self.id.0,
            freed_objects = stats.freed_objects,
            freed_bytes = stats.freed_bytes,
            "heap swept"
        );
        stats
    }

    /// The heap's root set
    pub fn roots(&self) -> &RootSet {
        &self.roots
    }

    /// Register `value` as a root until the guard drops
    pub fn root(self: &Arc<Self>, value: TaggedValue) -> RootGuard {
        let id = self.add_root(value);
        RootGuard {
            heap: self.clone(),
            id,
        }
    }

    /// Register a persistent root
    pub fn add_root(&self, value: TaggedValue) -> RootId {
        self.record_write(value);
        self.roots.add(value)
    }

    /// Remove a persistent root
    pub fn remove_root(&self, id: RootId) {
        self.roots.remove(id);
    }

    /// Insertion barrier: a value became reachable from somewhere the
    /// marker may already have scanned.
    pub fn record_write(&self, value: TaggedValue) {
        if value.is_heap_object() && self.marking.load(Ordering::Acquire) {
            self.barrier_buffer.lock().push(value);
        }
    }

    /// Drain the barrier buffer
    pub fn take_barrier_entries(&self) -> Vec<TaggedValue> {
        std::mem::take(&mut *self.barrier_buffer.lock())
    }

    /// Whether the barrier buffer holds entries
    pub fn has_barrier_entries(&self) -> bool {
        !self.barrier_buffer.lock().is_empty()
    }

    /// Whether a unified mark is running on this heap
    pub fn is_marking(&self) -> bool {
        self.marking.load(Ordering::Acquire)
    }

    pub(crate) fn set_marking(&self, marking: bool) {
        self.marking.store(marking, Ordering::Release);
        if !marking {
            self.barrier_buffer.lock().clear();
        }
    }

    /// Flag a local concurrent mark as in flight
    pub fn start_concurrent_marking(&self) {
        self.concurrent_marking.store(true, Ordering::Release);
    }

    /// Whether a local concurrent mark is in flight
    pub fn is_concurrent_marking(&self) -> bool {
        self.concurrent_marking.load(Ordering::Acquire)
    }

    /// Abandon an in-flight local concurrent mark and wait for its tasks.
    pub fn reset_concurrent_marker(&self) {
        if self.concurrent_marking.swap(false, Ordering::AcqRel) {
            self.wait_running_task_finished();
            tracing::debug!(target: "otter::gc", heap = self.id.0, "concurrent marker reset");
        }
    }

    /// Account for a background task touching this heap
    pub fn begin_task(self: &Arc<Self>) -> RunningTask {
        self.running_tasks.fetch_add(1, Ordering::AcqRel);
        RunningTask { heap: self.clone() }
    }

    /// Number of background tasks currently running
    pub fn running_task_count(&self) -> usize {
        self.running_tasks.load(Ordering::Acquire)
    }

    /// Block until no background task is running
    pub fn wait_running_task_finished(&self) {
        let mut guard = self.task_lock.lock();
        while self.running_tasks.load(Ordering::Acquire) != 0 {
            self.task_finished.wait(&mut guard);
        }
    }

    fn finish_task(&self) {
        if self.running_tasks.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _guard = self.task_lock.lock();
            self.task_finished.notify_all();
        }
    }
}

impl std::fmt::Debug for LocalHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalHeap")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("objects", &self.object_count())
            .finish()
    }
}

/// RAII accounting for one background task on a heap
pub struct RunningTask {
    heap: Arc<LocalHeap>,
}

impl Drop for RunningTask {
    fn drop(&mut self) {
        self.heap.finish_task();
    }
}

/// Handle to one root slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootId(usize);

/// Roots of one heap: globals, handles and stack slots of its owner.
#[derive(Default)]
pub struct RootSet {
    slots: Mutex<RootSlots>,
}

#[derive(Default)]
struct RootSlots {
    values: Vec<Option<TaggedValue>>,
    free: Vec<usize>,
}

impl RootSet {
    fn add(&self, value: TaggedValue) -> RootId {
        let mut slots = self.slots.lock();
        if let Some(index) = slots.free.pop() {
            slots.values[index] = Some(value);
            RootId(index)
        } else {
            slots.values.push(Some(value));
            RootId(slots.values.len() - 1)
        }
    }

    fn remove(&self, id: RootId) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.values.get_mut(id.0)
            && slot.take().is_some()
        {
            slots.free.push(id.0);
        }
    }

    /// Snapshot of every root value
    pub fn snapshot(&self) -> Vec<TaggedValue> {
        self.slots.lock().values.iter().flatten().copied().collect()
    }

    /// Number of registered roots
    pub fn len(&self) -> usize {
        self.slots.lock().values.iter().flatten().count()
    }

    /// Whether no root is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Keeps a value rooted for the guard's lifetime
pub struct RootGuard {
    heap: Arc<LocalHeap>,
    id: RootId,
}

impl Drop for RootGuard {
    fn drop(&mut self) {
        self.heap.remove_root(self.id);
    }
}

impl std::fmt::Debug for RootGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootGuard")
            .field("heap", &self.heap.id())
            .field("id", &self.id)
            .finish()
    }
}

/// Every heap of one VM, by id
#[derive(Default)]
pub struct HeapRegistry {
    heaps: RwLock<FxHashMap<HeapId, Arc<LocalHeap>>>,
}

impl HeapRegistry {
    /// Create an empty registry
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add a heap
    pub fn register(&self, heap: Arc<LocalHeap>) {
        self.heaps.write().insert(heap.id(), heap);
    }

    /// Remove a heap
    pub fn unregister(&self, id: HeapId) -> Option<Arc<LocalHeap>> {
        self.heaps.write().remove(&id)
    }

    /// Look up a heap
    pub fn heap(&self, id: HeapId) -> Option<Arc<LocalHeap>> {
        self.heaps.read().get(&id).cloned()
    }

    /// All heaps, ordered by id
    pub fn all(&self) -> Vec<Arc<LocalHeap>> {
        let mut heaps: Vec<_> = self.heaps.read().values().cloned().collect();
        heaps.sort_by_key(|heap| heap.id());
        heaps
    }

    /// Resolve a tagged value to its object, if it lives in one of our heaps
    pub fn resolve(&self, value: TaggedValue) -> Option<Arc<HeapObject>> {
        let r = value.as_object_ref()?;
        self.heap(r.heap)?.get(r)
    }

    /// Whether `r` is an allocated object of one of our heaps
    pub fn contain_object(&self, r: ObjectRef) -> bool {
        self.heap(r.heap).is_some_and(|heap| heap.contain_object(r))
    }

    /// Whether `r` is marked
    pub fn is_alive(&self, r: ObjectRef) -> bool {
        self.heap(r.heap).is_some_and(|heap| heap.is_alive(r))
    }
}
