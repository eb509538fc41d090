//! Shape-keyed enumeration cache
//!
//! Objects sharing a shape share one cached key array. An entry remembers
//! the prototype chain it was built against and is revalidated on every
//! lookup, so a mutation anywhere on the chain turns the next lookup into a
//! miss instead of a stale answer.

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::sync::Arc;

use otter_unified_gc::{ObjectRef, TaggedValue};

use crate::context::VmContext;
use crate::object::{JsObject, PropertyKey};
use crate::shape::ShapeId;

/// One prototype link as seen when the cache was built
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainLink {
    /// The prototype object
    pub object: ObjectRef,
    /// Its shape at build time
    pub shape: ShapeId,
}

/// Cached for-in keys of a receiver shape
#[derive(Debug, Clone)]
pub struct EnumCache {
    keys: Arc<[PropertyKey]>,
    chain: SmallVec<[ChainLink; 4]>,
}

impl EnumCache {
    /// Create a cache entry
    pub fn new(keys: Arc<[PropertyKey]>, chain: SmallVec<[ChainLink; 4]>) -> Self {
        Self { keys, chain }
    }

    /// Ordered, duplicate-free enumerable keys
    pub fn keys(&self) -> &Arc<[PropertyKey]> {
        &self.keys
    }

    /// Prototype chain the keys were computed from, nearest first
    pub fn chain(&self) -> &[ChainLink] {
        &self.chain
    }
}

/// An object can take part in a cached enumeration
pub(crate) fn is_cacheable(object: &JsObject) -> bool {
    !object.is_proxy() && !object.is_dictionary_mode() && object.element_count() == 0
}

/// Side table `ShapeId -> EnumCache`
#[derive(Debug, Default)]
pub struct EnumCacheTable {
    entries: RwLock<FxHashMap<ShapeId, EnumCache>>,
}

impl EnumCacheTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached keys for `receiver`, if an entry exists and its chain is
    /// unchanged
    pub fn try_get_enum_cache(&self, ctx: &VmContext, receiver: &JsObject) -> Option<Arc<[PropertyKey]>> {
        if !is_cacheable(receiver) {
            return None;
        }
        let shape = receiver.shape_id();
        let entry = self.entries.read().get(&shape).cloned()?;
        if Self::chain_matches(ctx, receiver.prototype(), entry.chain()) {
            Some(entry.keys)
        } else {
            tracing::trace!(target: "otter::vm", shape = shape.0, "enum cache entry stale");
            None
        }
    }

    fn chain_matches(ctx: &VmContext, mut prototype: TaggedValue, chain: &[ChainLink]) -> bool {
        for link in chain {
            if prototype.as_object_ref() != Some(link.object) {
                return false;
            }
            let Some(object) = ctx.object(prototype) else {
                return false;
            };
            if object.shape_id() != link.shape || !is_cacheable(&object) {
                return false;
            }
            prototype = object.prototype();
        }
        !prototype.is_heap_object()
    }

    /// Store keys computed for `shape`
    pub fn insert(&self, shape: ShapeId, cache: EnumCache) {
        self.entries.write().insert(shape, cache);
    }

    /// Drop the entry for `shape`
    pub fn invalidate(&self, shape: ShapeId) -> bool {
        self.entries.write().remove(&shape).is_some()
    }

    /// Drop every entry
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use otter_unified_gc::EcmaVm;

    fn context() -> VmContext {
        VmContext::new(Arc::new(EcmaVm::with_defaults().unwrap()), "test")
    }

    fn keys(names: &[&str]) -> Arc<[PropertyKey]> {
        names.iter().map(|n| PropertyKey::string(n)).collect()
    }

    #[test]
    fn test_hit_and_prototype_change() {
        let ctx = context();
        let proto = ctx.new_object(TaggedValue::null()).unwrap();
        proto.set("b".into(), TaggedValue::int32(1));
        let obj = ctx.new_object(proto.value()).unwrap();
        obj.set("a".into(), TaggedValue::int32(1));

        let chain = SmallVec::from_slice(&[ChainLink {
            object: proto.reference(),
            shape: proto.shape_id(),
        }]);
        ctx.enum_cache()
            .insert(obj.shape_id(), EnumCache::new(keys(&["a", "b"]), chain));
        assert_eq!(
            ctx.enum_cache().try_get_enum_cache(&ctx, &obj).as_deref(),
            Some(&keys(&["a", "b"])[..])
        );

        proto.set("c".into(), TaggedValue::int32(1));
        assert!(ctx.enum_cache().try_get_enum_cache(&ctx, &obj).is_none());
    }

    #[test]
    fn test_elements_on_receiver_miss() {
        let ctx = context();
        let obj = ctx.new_object(TaggedValue::null()).unwrap();
        obj.set("a".into(), TaggedValue::int32(1));
        ctx.enum_cache()
            .insert(obj.shape_id(), EnumCache::new(keys(&["a"]), SmallVec::new()));
        assert!(ctx.enum_cache().try_get_enum_cache(&ctx, &obj).is_some());

        obj.set(PropertyKey::Index(0), TaggedValue::int32(1));
        assert!(ctx.enum_cache().try_get_enum_cache(&ctx, &obj).is_none());
    }

    #[test]
    fn test_sibling_with_other_prototype_misses() {
        let ctx = context();
        let proto = ctx.new_object(TaggedValue::null()).unwrap();
        let a = ctx.new_object(TaggedValue::null()).unwrap();
        let b = ctx.new_object(proto.value()).unwrap();
        a.set("x".into(), TaggedValue::int32(1));
        b.set("x".into(), TaggedValue::int32(1));
        assert_eq!(a.shape_id(), b.shape_id());

        ctx.enum_cache()
            .insert(a.shape_id(), EnumCache::new(keys(&["x"]), SmallVec::new()));
        assert!(ctx.enum_cache().try_get_enum_cache(&ctx, &a).is_some());
        assert!(ctx.enum_cache().try_get_enum_cache(&ctx, &b).is_none());
        assert!(ctx.enum_cache().invalidate(a.shape_id()));
        assert!(ctx.enum_cache().is_empty());
    }
}
