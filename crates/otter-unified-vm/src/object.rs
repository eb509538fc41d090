//! JavaScript objects with hidden classes (shapes)
//!
//! Named properties live in slots laid out by a shared `Shape` until the
//! object is switched to dictionary mode. Integer-indexed properties live
//! in a separate elements vector whose empty slots are holes.

use indexmap::IndexMap;
use parking_lot::RwLock;
use rustc_hash::FxBuildHasher;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

use otter_unified_gc::{GcTraceable, TaggedValue};

use crate::context::VmContext;
use crate::error::VmResult;
use crate::shape::{Shape, ShapeId};

/// Property key (string, symbol or array index)
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum PropertyKey {
    /// String property key
    String(Arc<str>),
    /// Symbol property key
    Symbol(u64),
    /// Integer index (stored in elements)
    Index(u32),
}

impl PropertyKey {
    /// Create a string property key
    pub fn string(s: &str) -> Self {
        Self::String(Arc::from(s))
    }

    /// Create an index property key
    pub fn index(i: u32) -> Self {
        Self::Index(i)
    }

    /// Whether for-in and `Object.keys` report this key
    pub fn is_string_like(&self) -> bool {
        !matches!(self, Self::Symbol(_))
    }
}

impl From<&str> for PropertyKey {
    fn from(s: &str) -> Self {
        Self::string(s)
    }
}

impl From<u32> for PropertyKey {
    fn from(i: u32) -> Self {
        Self::Index(i)
    }
}

impl fmt::Display for PropertyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => f.write_str(s),
            Self::Symbol(id) => write!(f, "Symbol({id})"),
            Self::Index(i) => write!(f, "{i}"),
        }
    }
}

/// Property attributes
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct PropertyAttributes {
    /// Property is writable
    pub writable: bool,
    /// Property is enumerable
    pub enumerable: bool,
    /// Property is configurable
    pub configurable: bool,
}

impl PropertyAttributes {
    /// Default data property attributes
    pub const fn data() -> Self {
        Self {
            writable: true,
            enumerable: true,
            configurable: true,
        }
    }

    /// Writable and configurable but not enumerable
    pub const fn hidden() -> Self {
        Self {
            writable: true,
            enumerable: false,
            configurable: true,
        }
    }

    /// Non-writable, non-enumerable, non-configurable
    pub const fn frozen() -> Self {
        Self {
            writable: false,
            enumerable: false,
            configurable: false,
        }
    }
}

/// Data property descriptor
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PropertyDescriptor {
    /// The value
    pub value: TaggedValue,
    /// Attributes
    pub attributes: PropertyAttributes,
}

impl PropertyDescriptor {
    /// Create a data property
    pub fn data(value: TaggedValue) -> Self {
        Self {
            value,
            attributes: PropertyAttributes::data(),
        }
    }

    /// Create a data property with specific attributes
    pub fn data_with_attrs(value: TaggedValue, attributes: PropertyAttributes) -> Self {
        Self { value, attributes }
    }

    /// Check if enumerable
    pub fn enumerable(&self) -> bool {
        self.attributes.enumerable
    }
}

/// Traps of a proxy object. Every trap may raise.
pub trait ProxyHandler: Send + Sync {
    /// `[[OwnPropertyKeys]]`
    fn own_keys(&self, ctx: &VmContext) -> VmResult<Vec<PropertyKey>>;

    /// `[[GetOwnProperty]]`
    fn get_own_property(&self, ctx: &VmContext, key: &PropertyKey) -> VmResult<Option<PropertyDescriptor>>;

    /// `[[GetPrototypeOf]]`
    fn get_prototype(&self, ctx: &VmContext) -> VmResult<TaggedValue>;

    /// Report heap values the handler keeps alive
    fn trace(&self, _tracer: &mut dyn FnMut(TaggedValue)) {}
}

type Dictionary = IndexMap<PropertyKey, PropertyDescriptor, FxBuildHasher>;

struct ObjectInner {
    shape: Arc<Shape>,
    slots: Vec<TaggedValue>,
    /// Some once the object left shape mode
    dictionary: Option<Dictionary>,
    /// Indexed properties; holes are empty
    elements: Vec<TaggedValue>,
    prototype: TaggedValue,
    /// A property was deleted since the last key enumeration
    has_pending_delete: bool,
}

/// A JavaScript object
///
/// Thread-safe with interior mutability.
pub struct JsObject {
    inner: RwLock<ObjectInner>,
    proxy: Option<Arc<dyn ProxyHandler>>,
}

impl JsObject {
    /// Create a new empty object with `shape` (normally the root shape)
    pub fn new(shape: Arc<Shape>, prototype: TaggedValue) -> Self {
        Self {
            inner: RwLock::new(ObjectInner {
                shape,
                slots: Vec::new(),
                dictionary: None,
                elements: Vec::new(),
                prototype,
                has_pending_delete: false,
            }),
            proxy: None,
        }
    }

    /// Create a proxy object. Its own storage stays empty.
    pub fn new_proxy(shape: Arc<Shape>, handler: Arc<dyn ProxyHandler>) -> Self {
        let mut object = Self::new(shape, TaggedValue::null());
        object.proxy = Some(handler);
        object
    }

    /// Whether this is a proxy
    pub fn is_proxy(&self) -> bool {
        self.proxy.is_some()
    }

    /// Proxy traps, if this is a proxy
    pub fn proxy_handler(&self) -> Option<&Arc<dyn ProxyHandler>> {
        self.proxy.as_ref()
    }

    /// Current shape
    pub fn shape(&self) -> Arc<Shape> {
        self.inner.read().shape.clone()
    }

    /// Current shape id
    pub fn shape_id(&self) -> ShapeId {
        self.inner.read().shape.id()
    }

    /// Whether the object is in dictionary mode
    pub fn is_dictionary_mode(&self) -> bool {
        self.inner.read().dictionary.is_some()
    }

    /// Number of non-hole elements
    pub fn element_count(&self) -> usize {
        self.inner.read().elements.iter().filter(|v| !v.is_hole()).count()
    }

    /// Prototype (null at the end of the chain)
    pub fn prototype(&self) -> TaggedValue {
        self.inner.read().prototype
    }

    /// Replace the prototype
    pub fn set_prototype(&self, prototype: TaggedValue) {
        self.inner.write().prototype = prototype;
    }

    /// Whether a property was deleted since the flag was last cleared
    pub fn has_pending_delete(&self) -> bool {
        self.inner.read().has_pending_delete
    }

    /// Forget earlier deletions
    pub fn clear_pending_delete(&self) {
        self.inner.write().has_pending_delete = false;
    }

    /// Get own property value
    pub fn get(&self, key: &PropertyKey) -> Option<TaggedValue> {
        self.get_own_property(key).map(|desc| desc.value)
    }

    /// Set (or create) an enumerable data property
    pub fn set(&self, key: PropertyKey, value: TaggedValue) {
        self.define_property(key, PropertyDescriptor::data(value));
    }

    /// Define a property with descriptor
    pub fn define_property(&self, key: PropertyKey, desc: PropertyDescriptor) {
        let mut guard = self.inner.write();
        let inner = &mut *guard;

        if let PropertyKey::Index(i) = key {
            let index = i as usize;
            if index >= inner.elements.len() {
                inner.elements.resize(index + 1, TaggedValue::hole());
            }
            inner.elements[index] = desc.value;
            return;
        }

        if let Some(dictionary) = inner.dictionary.as_mut() {
            dictionary.insert(key, desc);
            return;
        }

        match inner.shape.lookup(&key) {
            Some((offset, attributes)) if attributes == desc.attributes => {
                inner.slots[offset] = desc.value;
            }
            Some(_) => {
                // Attribute change has no transition; fall back to a dictionary
                let mut dictionary = Self::to_dictionary(inner);
                dictionary.insert(key, desc);
                inner.dictionary = Some(dictionary);
                inner.slots.clear();
            }
            None => {
                let shape = inner.shape.transition(key, desc.attributes);
                inner.shape = shape;
                inner.slots.push(desc.value);
            }
        }
    }

    fn to_dictionary(inner: &ObjectInner) -> Dictionary {
        inner
            .shape
            .own_keys()
            .iter()
            .zip(inner.slots.iter())
            .map(|((key, attributes), value)| {
                (key.clone(), PropertyDescriptor::data_with_attrs(*value, *attributes))
            })
            .collect()
    }

    /// Get own property descriptor
    pub fn get_own_property(&self, key: &PropertyKey) -> Option<PropertyDescriptor> {
        let inner = self.inner.read();
        if let PropertyKey::Index(i) = key {
            return inner
                .elements
                .get(*i as usize)
                .filter(|v| !v.is_hole())
                .map(|v| PropertyDescriptor::data(*v));
        }
        if let Some(dictionary) = &inner.dictionary {
            return dictionary.get(key).copied();
        }
        let (offset, attributes) = inner.shape.lookup(key)?;
        Some(PropertyDescriptor::data_with_attrs(inner.slots[offset], attributes))
    }

    /// Check if object has own property
    pub fn has_own(&self, key: &PropertyKey) -> bool {
        self.get_own_property(key).is_some()
    }

    /// Delete an own property.
    ///
    /// Deleting the last-added named property steps back to the parent
    /// shape; deleting any other switches to dictionary mode. Either way the
    /// shape changes and the pending-delete flag is set.
    pub fn delete(&self, key: &PropertyKey) -> bool {
        let mut guard = self.inner.write();
        let inner = &mut *guard;

        if let PropertyKey::Index(i) = key {
            let index = *i as usize;
            let present = inner.elements.get(index).is_some_and(|v| !v.is_hole());
            if present {
                inner.elements[index] = TaggedValue::hole();
                inner.has_pending_delete = true;
            }
            return present;
        }

        if let Some(dictionary) = inner.dictionary.as_mut() {
            let configurable = dictionary.get(key).is_some_and(|desc| desc.attributes.configurable);
            if configurable {
                dictionary.shift_remove(key);
                inner.has_pending_delete = true;
            }
            return configurable;
        }

        let Some((_, attributes)) = inner.shape.lookup(key) else {
            return false;
        };
        if !attributes.configurable {
            return false;
        }

        let is_last = inner.shape.last_key() == Some(key);
        match inner.shape.parent().cloned() {
            Some(parent) if is_last => {
                inner.shape = parent;
                inner.slots.pop();
            }
            _ => {
                let mut dictionary = Self::to_dictionary(inner);
                dictionary.shift_remove(key);
                inner.dictionary = Some(dictionary);
                inner.slots.clear();
            }
        }
        inner.has_pending_delete = true;
        true
    }

    /// Own keys in enumeration order: indices ascending, then named keys
    /// in insertion order (symbols included), with their attributes
    pub fn own_property_keys(&self) -> Vec<(PropertyKey, PropertyAttributes)> {
        let inner = self.inner.read();
        let mut keys: Vec<(PropertyKey, PropertyAttributes)> = inner
            .elements
            .iter()
            .enumerate()
            .filter(|(_, v)| !v.is_hole())
            .map(|(i, _)| (PropertyKey::Index(i as u32), PropertyAttributes::data()))
            .collect();
        match &inner.dictionary {
            Some(dictionary) => keys.extend(
                dictionary
                    .iter()
                    .map(|(key, desc)| (key.clone(), desc.attributes)),
            ),
            None => keys.extend(inner.shape.own_keys().iter().cloned()),
        }
        keys
    }

    /// Own enumerable string-like keys in enumeration order
    pub fn own_enumerable_keys(&self) -> Vec<PropertyKey> {
        self.own_property_keys()
            .into_iter()
            .filter(|(key, attributes)| attributes.enumerable && key.is_string_like())
            .map(|(key, _)| key)
            .collect()
    }
}

impl GcTraceable for JsObject {
    fn trace(&self, tracer: &mut dyn FnMut(TaggedValue)) {
        let inner = self.inner.read();
        tracer(inner.prototype);
        for value in &inner.slots {
            tracer(*value);
        }
        if let Some(dictionary) = &inner.dictionary {
            for desc in dictionary.values() {
                tracer(desc.value);
            }
        }
        for value in &inner.elements {
            tracer(*value);
        }
        drop(inner);
        if let Some(handler) = &self.proxy {
            handler.trace(tracer);
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl fmt::Debug for JsObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("JsObject")
            .field("shape", &inner.shape.id())
            .field("dictionary", &inner.dictionary.is_some())
            .field("elements", &inner.elements.len())
            .field("proxy", &self.proxy.is_some())
            .finish()
    }
}
