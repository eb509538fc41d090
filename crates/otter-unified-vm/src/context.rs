//! VM execution context
//!
//! A context is one managed thread of an [`EcmaVm`]: it owns the thread's
//! registration, allocates on its local heap and carries the per-context
//! caches (interned strings, the enumeration cache).

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;

use otter_unified_gc::{
    CollectionStats, EcmaVm, GcRef, GcTraceable, JsThread, LocalHeap, RootGuard, TaggedValue,
};

use crate::enum_cache::EnumCacheTable;
use crate::error::VmResult;
use crate::object::{JsObject, ProxyHandler};
use crate::shape::Shape;
use crate::string::JsString;

/// Per-thread execution context
pub struct VmContext {
    vm: Arc<EcmaVm>,
    thread: Arc<JsThread>,
    root_shape: Arc<Shape>,
    enum_cache: EnumCacheTable,
    /// Interned strings, rooted for the context's lifetime
    strings: Mutex<FxHashMap<Arc<str>, (TaggedValue, RootGuard)>>,
}

impl VmContext {
    /// Register a new managed thread on `vm` and wrap it
    pub fn new(vm: Arc<EcmaVm>, name: impl Into<String>) -> Self {
        let thread = vm.create_thread(name);
        Self {
            vm,
            thread,
            root_shape: Shape::root(),
            enum_cache: EnumCacheTable::new(),
            strings: Mutex::new(FxHashMap::default()),
        }
    }

    /// The owning VM
    pub fn vm(&self) -> &Arc<EcmaVm> {
        &self.vm
    }

    /// The managed thread backing this context
    pub fn thread(&self) -> &Arc<JsThread> {
        &self.thread
    }

    /// This context's local heap
    pub fn heap(&self) -> &Arc<LocalHeap> {
        self.thread.heap()
    }

    /// The empty shape every ordinary object starts from
    pub fn root_shape(&self) -> &Arc<Shape> {
        &self.root_shape
    }

    /// The shape-keyed enumeration cache
    pub fn enum_cache(&self) -> &EnumCacheTable {
        &self.enum_cache
    }

    /// Allocate `body` on the local heap. Allocation is a safepoint.
    pub fn alloc<T: GcTraceable>(&self, body: T) -> VmResult<GcRef<T>> {
        self.thread.check_safepoint();
        Ok(self.heap().allocate_typed(body)?)
    }

    /// Typed view of `value` if it is a live `T` on any heap of this VM
    pub fn resolve<T: GcTraceable>(&self, value: TaggedValue) -> Option<GcRef<T>> {
        let reference = value.as_object_ref()?;
        let cell = self.vm.heaps().resolve(value)?;
        GcRef::new(reference, cell)
    }

    /// `value` as an object, if it is one
    pub fn object(&self, value: TaggedValue) -> Option<GcRef<JsObject>> {
        self.resolve(value)
    }

    /// Allocate an ordinary empty object
    pub fn new_object(&self, prototype: TaggedValue) -> VmResult<GcRef<JsObject>> {
        self.alloc(JsObject::new(self.root_shape.clone(), prototype))
    }

    /// Allocate a proxy object
    pub fn new_proxy(&self, handler: Arc<dyn ProxyHandler>) -> VmResult<GcRef<JsObject>> {
        self.alloc(JsObject::new_proxy(self.root_shape.clone(), handler))
    }

    /// Interned string value; equal contents give the same heap object
    pub fn intern(&self, s: &str) -> VmResult<TaggedValue> {
        let mut strings = self.strings.lock();
        if let Some((value, _)) = strings.get(s) {
            return Ok(*value);
        }
        let data: Arc<str> = Arc::from(s);
        let string = self.alloc(JsString::new(data.clone()))?;
        let guard = self.heap().root(string.value());
        strings.insert(data, (string.value(), guard));
        Ok(string.value())
    }

    /// Contents of `value` if it is a string
    pub fn string_contents(&self, value: TaggedValue) -> Option<Arc<str>> {
        self.resolve::<JsString>(value).map(|s| s.data().clone())
    }

    /// Keep `value` alive until the guard drops
    pub fn root(&self, value: TaggedValue) -> RootGuard {
        self.heap().root(value)
    }

    /// Run a full collection, waiting outside managed code
    pub fn collect_garbage(&self) -> VmResult<CollectionStats> {
        Ok(self.thread.blocking_native(|| self.vm.collect_garbage())?)
    }
}

impl Drop for VmContext {
    fn drop(&mut self) {
        self.strings.get_mut().clear();
        self.vm.destroy_thread(&self.thread);
    }
}

impl std::fmt::Debug for VmContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmContext")
            .field("thread", &self.thread.id())
            .field("heap", &self.heap().id())
            .finish()
    }
}
