//! Hidden Classes (Shapes) for property layout.
//!
//! A Shape represents the structure of an object: what properties it has,
//! their attributes and at what offsets they are stored. Shapes are shared
//! between objects with the same structure using a transition tree.
//!
//! Every shape carries a process-unique `ShapeId`; the enumeration cache is
//! keyed by it.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::object::{PropertyAttributes, PropertyKey};

static NEXT_SHAPE_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a shape. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShapeId(pub u64);

/// A Shape defines the layout of properties in an object.
pub struct Shape {
    id: ShapeId,

    /// The parent shape from which this shape was transitioned.
    /// None for the root (empty) shape.
    parent: Option<Arc<Shape>>,

    /// The property key that was added to the parent to create this shape.
    key: Option<PropertyKey>,

    /// The offset of the property in the object's slot vector.
    offset: Option<usize>,

    /// Transitions to child shapes. Child -> Parent is strong (Arc),
    /// Parent -> Child is Weak.
    transitions: Mutex<FxHashMap<(PropertyKey, PropertyAttributes), Weak<Shape>>>,

    /// All property offsets in this shape (inherited + own).
    property_map: FxHashMap<PropertyKey, usize>,

    /// Keys in insertion order, with their attributes
    keys_ordered: Vec<(PropertyKey, PropertyAttributes)>,
}

impl Shape {
    /// Create a new root (empty) shape.
    pub fn root() -> Arc<Self> {
        Arc::new(Self {
            id: ShapeId(NEXT_SHAPE_ID.fetch_add(1, Ordering::Relaxed)),
            parent: None,
            key: None,
            offset: None,
            transitions: Mutex::new(FxHashMap::default()),
            property_map: FxHashMap::default(),
            keys_ordered: Vec::new(),
        })
    }

    /// Find a transition for a given key, or create a new one.
    pub fn transition(self: &Arc<Self>, key: PropertyKey, attributes: PropertyAttributes) -> Arc<Self> {
        let mut transitions = self.transitions.lock();
        let edge = (key.clone(), attributes);
        if let Some(shape) = transitions.get(&edge).and_then(Weak::upgrade) {
            return shape;
        }

        let next_offset = self.keys_ordered.len();

        let mut property_map = self.property_map.clone();
        property_map.insert(key.clone(), next_offset);

        let mut keys_ordered = self.keys_ordered.clone();
        keys_ordered.push((key.clone(), attributes));

        let shape = Arc::new(Self {
            id: ShapeId(NEXT_SHAPE_ID.fetch_add(1, Ordering::Relaxed)),
            parent: Some(Arc::clone(self)),
            key: Some(key),
            offset: Some(next_offset),
            transitions: Mutex::new(FxHashMap::default()),
            property_map,
            keys_ordered,
        });

        transitions.insert(edge, Arc::downgrade(&shape));
        shape
    }

    /// Shape identity
    pub fn id(&self) -> ShapeId {
        self.id
    }

    /// The shape this one transitioned from
    pub fn parent(&self) -> Option<&Arc<Shape>> {
        self.parent.as_ref()
    }

    /// The key whose addition created this shape
    pub fn last_key(&self) -> Option<&PropertyKey> {
        self.key.as_ref()
    }

    /// Slot of the last-added key
    pub fn last_offset(&self) -> Option<usize> {
        self.offset
    }

    /// Get the offset of a property key in this shape.
    pub fn get_offset(&self, key: &PropertyKey) -> Option<usize> {
        self.property_map.get(key).copied()
    }

    /// Offset and attributes of a key
    pub fn lookup(&self, key: &PropertyKey) -> Option<(usize, PropertyAttributes)> {
        let offset = self.get_offset(key)?;
        Some((offset, self.keys_ordered[offset].1))
    }

    /// All own property keys in insertion order.
    pub fn own_keys(&self) -> &[(PropertyKey, PropertyAttributes)] {
        &self.keys_ordered
    }

    /// Get the number of properties defined in this shape.
    pub fn property_count(&self) -> usize {
        self.keys_ordered.len()
    }
}

impl std::fmt::Debug for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shape")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("offset", &self.offset)
            .field("property_count", &self.property_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions_are_shared() {
        let root = Shape::root();
        let a1 = root.transition(PropertyKey::string("a"), PropertyAttributes::data());
        let a2 = root.transition(PropertyKey::string("a"), PropertyAttributes::data());
        assert!(Arc::ptr_eq(&a1, &a2));
        assert_eq!(a1.id(), a2.id());
        assert_ne!(root.id(), a1.id());
    }

    #[test]
    fn test_attributes_split_transitions() {
        let root = Shape::root();
        let enumerable = root.transition(PropertyKey::string("a"), PropertyAttributes::data());
        let hidden = root.transition(PropertyKey::string("a"), PropertyAttributes::hidden());
        assert_ne!(enumerable.id(), hidden.id());
    }

    #[test]
    fn test_offsets_and_order() {
        let shape = Shape::root()
            .transition(PropertyKey::string("x"), PropertyAttributes::data())
            .transition(PropertyKey::string("y"), PropertyAttributes::data());
        assert_eq!(shape.get_offset(&PropertyKey::string("x")), Some(0));
        assert_eq!(shape.get_offset(&PropertyKey::string("y")), Some(1));
        let keys: Vec<_> = shape.own_keys().iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(keys, vec![PropertyKey::string("x"), PropertyKey::string("y")]);
        assert_eq!(shape.parent().unwrap().property_count(), 1);
    }
}
