//! Property enumeration (`for-in`, `Object.keys`)
//!
//! [`PropertyAccessor`] walks a receiver's prototype chain once on
//! construction and classifies it. Chains made only of shape-mode objects
//! without indexed elements can be cached per receiver shape; chains that
//! additionally have no shadowed keys take the fast path, which is a plain
//! concatenation of each link's enumerable keys. Everything else (proxies,
//! shadowing, dictionary objects, elements) goes through the slow path,
//! which resolves duplicates nearest-wins.

use rustc_hash::FxHashSet;
use smallvec::SmallVec;
use std::sync::Arc;

use otter_unified_gc::{GcRef, ObjectRef, TaggedValue};

use crate::context::VmContext;
use crate::enum_cache::{ChainLink, EnumCache};
use crate::error::{VmError, VmResult};
use crate::object::{JsObject, PropertyDescriptor, PropertyKey};
use crate::shape::ShapeId;

/// Maximum prototype chain length before the chain is treated as cyclic
const MAX_PROTOTYPE_CHAIN_DEPTH: usize = 10_000;

fn cyclic_chain() -> VmError {
    VmError::type_error("Cyclic __proto__ value")
}

/// `[[GetOwnProperty]]`, dispatching to proxy traps
pub fn get_own_property(
    ctx: &VmContext,
    object: &JsObject,
    key: &PropertyKey,
) -> VmResult<Option<PropertyDescriptor>> {
    match object.proxy_handler() {
        Some(handler) => handler.get_own_property(ctx, key),
        None => Ok(object.get_own_property(key)),
    }
}

/// `[[GetPrototypeOf]]`, dispatching to proxy traps
pub fn get_prototype(ctx: &VmContext, object: &JsObject) -> VmResult<TaggedValue> {
    match object.proxy_handler() {
        Some(handler) => handler.get_prototype(ctx),
        None => Ok(object.prototype()),
    }
}

/// `[[HasProperty]]`: own or inherited
pub fn has_property(ctx: &VmContext, object: &GcRef<JsObject>, key: &PropertyKey) -> VmResult<bool> {
    let mut current = object.clone();
    for _ in 0..MAX_PROTOTYPE_CHAIN_DEPTH {
        if get_own_property(ctx, &current, key)?.is_some() {
            return Ok(true);
        }
        match ctx.object(get_prototype(ctx, &current)?) {
            Some(next) => current = next,
            None => return Ok(false),
        }
    }
    Err(cyclic_chain())
}

/// One-shot key collector for a receiver
pub struct PropertyAccessor<'a> {
    ctx: &'a VmContext,
    receiver: GcRef<JsObject>,
    /// Receiver first, then each prototype
    chain: SmallVec<[GcRef<JsObject>; 4]>,
    /// Enumerable string keys seen on the chain, shadowed ones included
    key_length: usize,
    /// Enumerable string keys left once shadowing is resolved
    actual_key_length: usize,
    shadow_key_length: usize,
    element_count: usize,
    can_use_enum_cache: bool,
    only_has_simple_properties: bool,
}

impl<'a> PropertyAccessor<'a> {
    /// Walk and classify the receiver's prototype chain.
    ///
    /// Fails if a proxy trap raises or the chain is cyclic.
    pub fn new(ctx: &'a VmContext, receiver: GcRef<JsObject>) -> VmResult<Self> {
        let mut accessor = Self {
            ctx,
            receiver,
            chain: SmallVec::new(),
            key_length: 0,
            actual_key_length: 0,
            shadow_key_length: 0,
            element_count: 0,
            can_use_enum_cache: true,
            only_has_simple_properties: true,
        };
        accessor.pre_load()?;
        Ok(accessor)
    }

    fn pre_load(&mut self) -> VmResult<()> {
        let mut visited: FxHashSet<ObjectRef> = FxHashSet::default();
        let mut seen: FxHashSet<PropertyKey> = FxHashSet::default();
        let mut current = Some(self.receiver.clone());

        while let Some(object) = current {
            if !visited.insert(object.reference()) || self.chain.len() >= MAX_PROTOTYPE_CHAIN_DEPTH {
                return Err(cyclic_chain());
            }

            let prototype = match object.proxy_handler() {
                Some(handler) => {
                    self.disable_enum_cache();
                    handler.get_prototype(self.ctx)?
                }
                None => {
                    let elements = object.element_count();
                    if elements > 0 || object.is_dictionary_mode() {
                        self.disable_enum_cache();
                    }
                    self.element_count += elements;
                    for (key, attributes) in object.own_property_keys() {
                        if !key.is_string_like() {
                            continue;
                        }
                        let nearest = seen.insert(key);
                        if attributes.enumerable {
                            self.key_length += 1;
                            if nearest {
                                self.actual_key_length += 1;
                            }
                        }
                        if !nearest {
                            self.shadow_key_length += 1;
                            self.only_has_simple_properties = false;
                        }
                    }
                    object.prototype()
                }
            };

            self.chain.push(object);
            current = self.ctx.object(prototype);
        }

        tracing::trace!(
            target: "otter::vm",
            links = self.chain.len(),
            keys = self.key_length,
            actual = self.actual_key_length,
            shadowed = self.shadow_key_length,
            simple = self.only_has_simple_properties,
            cacheable = self.can_use_enum_cache,
            "enumeration preload"
        );
        Ok(())
    }

    fn disable_enum_cache(&mut self) {
        self.can_use_enum_cache = false;
        self.only_has_simple_properties = false;
    }

    /// The receiver
    pub fn receiver(&self) -> &GcRef<JsObject> {
        &self.receiver
    }

    /// Number of objects on the chain, receiver included
    pub fn chain_len(&self) -> usize {
        self.chain.len()
    }

    /// Enumerable keys seen before de-duplication
    pub fn key_length(&self) -> usize {
        self.key_length
    }

    /// Length of the de-duplicated key list.
    ///
    /// Exact for chains of ordinary objects; keys reported by proxy traps
    /// are not known until the slow path runs.
    pub fn actual_key_length(&self) -> usize {
        self.actual_key_length
    }

    /// Keys hidden by a same-named key nearer the receiver
    pub fn shadow_key_length(&self) -> usize {
        self.shadow_key_length
    }

    /// Indexed elements seen on the chain
    pub fn element_count(&self) -> usize {
        self.element_count
    }

    /// Whether the result may be stored in the enum cache
    pub fn can_use_enum_cache(&self) -> bool {
        self.can_use_enum_cache
    }

    /// Whether the fast path applies
    pub fn only_has_simple_properties(&self) -> bool {
        self.only_has_simple_properties
    }

    /// Concatenate each link's enumerable keys.
    ///
    /// Only meaningful when [`only_has_simple_properties`](Self::only_has_simple_properties)
    /// holds: there is nothing to de-duplicate then.
    pub fn get_keys_fast(&self) -> Arc<[PropertyKey]> {
        let mut keys = Vec::with_capacity(self.actual_key_length);
        for object in &self.chain {
            keys.extend(object.own_enumerable_keys());
        }
        keys.into()
    }

    /// Collect keys link by link, then drop every key an earlier link also
    /// owns (enumerable or not).
    pub fn get_keys_slow(&self) -> VmResult<Arc<[PropertyKey]>> {
        let mut candidates: Vec<Option<PropertyKey>> = Vec::with_capacity(self.key_length);

        for (depth, object) in self.chain.iter().enumerate() {
            let start = candidates.len();
            match object.proxy_handler() {
                Some(handler) => {
                    let mut reported = FxHashSet::default();
                    for key in handler.own_keys(self.ctx)? {
                        if !key.is_string_like() || !reported.insert(key.clone()) {
                            candidates.push(None);
                            continue;
                        }
                        let enumerable = handler
                            .get_own_property(self.ctx, &key)?
                            .is_some_and(|desc| desc.enumerable());
                        candidates.push(enumerable.then_some(key));
                    }
                }
                None => candidates.extend(
                    object
                        .own_property_keys()
                        .into_iter()
                        .map(|(key, attributes)| (attributes.enumerable && key.is_string_like()).then_some(key)),
                ),
            }

            for slot in &mut candidates[start..] {
                let shadowed = match slot.as_ref() {
                    Some(key) => self.is_shadowed(depth, key)?,
                    None => false,
                };
                if shadowed {
                    *slot = None;
                }
            }
        }

        Ok(candidates.into_iter().flatten().collect())
    }

    fn is_shadowed(&self, depth: usize, key: &PropertyKey) -> VmResult<bool> {
        for earlier in &self.chain[..depth] {
            if get_own_property(self.ctx, earlier, key)?.is_some() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Keys for `for-in`, stored in the enum cache when the chain allows it
    pub fn get_keys(&self) -> VmResult<Arc<[PropertyKey]>> {
        let keys = if self.only_has_simple_properties {
            self.get_keys_fast()
        } else {
            self.get_keys_slow()?
        };

        if self.can_use_enum_cache {
            let chain = self
                .chain
                .iter()
                .skip(1)
                .map(|object| ChainLink {
                    object: object.reference(),
                    shape: object.shape_id(),
                })
                .collect();
            self.ctx
                .enum_cache()
                .insert(self.receiver.shape_id(), EnumCache::new(keys.clone(), chain));
        }
        self.receiver.clear_pending_delete();
        Ok(keys)
    }
}

/// Start a `for-in` over `value`. Primitives enumerate nothing.
pub fn enumerate_object_properties(ctx: &VmContext, value: TaggedValue) -> VmResult<ForInIterator> {
    let Some(receiver) = ctx.object(value) else {
        return Ok(ForInIterator::empty());
    };
    let keys = match ctx.enum_cache().try_get_enum_cache(ctx, &receiver) {
        Some(keys) => keys,
        None => PropertyAccessor::new(ctx, receiver.clone())?.get_keys()?,
    };
    ForInIterator::new(ctx, receiver, keys)
}

/// `Object.keys`: own enumerable string keys
pub fn object_keys(ctx: &VmContext, value: TaggedValue) -> VmResult<Vec<PropertyKey>> {
    if value.is_undefined() || value.is_null() {
        return Err(VmError::type_error("Cannot convert undefined or null to object"));
    }
    let Some(object) = ctx.object(value) else {
        return Ok(Vec::new());
    };
    let Some(handler) = object.proxy_handler() else {
        return Ok(object.own_enumerable_keys());
    };
    let mut keys = Vec::new();
    for key in handler.own_keys(ctx)? {
        if key.is_string_like()
            && handler
                .get_own_property(ctx, &key)?
                .is_some_and(|desc| desc.enumerable())
        {
            keys.push(key);
        }
    }
    Ok(keys)
}

/// State of one `for-in` loop.
///
/// Keys are fixed when the loop starts. A key deleted before it is reached
/// is skipped; the check runs only once some ordinary object on the chain
/// changed shape or recorded a delete.
pub struct ForInIterator {
    keys: Arc<[PropertyKey]>,
    index: usize,
    receiver: Option<GcRef<JsObject>>,
    chain: SmallVec<[(GcRef<JsObject>, ShapeId); 4]>,
}

impl ForInIterator {
    fn empty() -> Self {
        Self {
            keys: Arc::from(Vec::new()),
            index: 0,
            receiver: None,
            chain: SmallVec::new(),
        }
    }

    fn new(ctx: &VmContext, receiver: GcRef<JsObject>, keys: Arc<[PropertyKey]>) -> VmResult<Self> {
        let mut chain: SmallVec<[(GcRef<JsObject>, ShapeId); 4]> = SmallVec::new();
        let mut current = Some(receiver.clone());
        while let Some(object) = current {
            if chain.len() >= MAX_PROTOTYPE_CHAIN_DEPTH {
                return Err(cyclic_chain());
            }
            if object.is_proxy() {
                break;
            }
            let shape = object.shape_id();
            current = ctx.object(object.prototype());
            chain.push((object, shape));
        }
        Ok(Self {
            keys,
            index: 0,
            receiver: Some(receiver),
            chain,
        })
    }

    fn chain_changed(&self) -> bool {
        self.chain
            .iter()
            .any(|(object, shape)| object.shape_id() != *shape || object.has_pending_delete())
    }

    /// All keys captured at loop start
    pub fn keys(&self) -> &[PropertyKey] {
        &self.keys
    }

    /// Next key still present on the receiver or its prototypes
    pub fn next(&mut self, ctx: &VmContext) -> VmResult<Option<PropertyKey>> {
        let Some(receiver) = self.receiver.as_ref() else {
            return Ok(None);
        };
        while let Some(key) = self.keys.get(self.index) {
            self.index += 1;
            if self.chain_changed() && !has_property(ctx, receiver, key)? {
                continue;
            }
            return Ok(Some(key.clone()));
        }
        Ok(None)
    }

    /// Drain the remaining keys
    pub fn collect_remaining(&mut self, ctx: &VmContext) -> VmResult<Vec<PropertyKey>> {
        let mut keys = Vec::new();
        while let Some(key) = self.next(ctx)? {
            keys.push(key);
        }
        Ok(keys)
    }
}

impl std::fmt::Debug for ForInIterator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForInIterator")
            .field("keys", &self.keys.len())
            .field("index", &self.index)
            .finish()
    }
}
