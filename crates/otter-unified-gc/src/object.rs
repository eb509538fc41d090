//! GC object layout

use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::RwLock;

use crate::value::{ObjectRef, TaggedValue};

/// Where an object stands in the current mark episode
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkColor {
    /// Unreached; swept if still white after a completed mark
    White,
    /// Reached and queued, fields still to trace
    Gray,
    /// Reached with every field traced, or allocated during the mark
    Black,
}

impl MarkColor {
    const fn from_bits(bits: u8) -> Self {
        match bits {
            0 => Self::White,
            1 => Self::Gray,
            _ => Self::Black,
        }
    }
}

/// Class of a heap object as far as the collector cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectClass {
    /// All fields point into this VM's heaps
    Ordinary,
    /// May hold references into the companion VM's heap
    XRef,
}

/// Collector state carried by every heap object.
///
/// Within an episode the colour only advances, White to Gray through
/// [`try_mark`](Self::try_mark) and Gray to Black through
/// [`blacken`](Self::blacken). [`whiten`](Self::whiten) rewinds it when
/// the next episode initializes.
pub struct GcHeader {
    color: AtomicU8,
    class: ObjectClass,
    /// Estimated size in bytes
    size: usize,
}

impl GcHeader {
    /// A white header
    pub const fn new(class: ObjectClass, size: usize) -> Self {
        Self {
            color: AtomicU8::new(MarkColor::White as u8),
            class,
            size,
        }
    }

    /// Current colour
    pub fn color(&self) -> MarkColor {
        MarkColor::from_bits(self.color.load(Ordering::Acquire))
    }

    /// Shade a white object gray.
    ///
    /// Returns `true` for exactly one caller per object per episode; that
    /// caller owns queueing it.
    pub fn try_mark(&self) -> bool {
        self.color
            .compare_exchange(
                MarkColor::White as u8,
                MarkColor::Gray as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Fields traced, or born during a mark
    pub fn blacken(&self) {
        self.color.store(MarkColor::Black as u8, Ordering::Release);
    }

    /// Back to white for a new episode
    pub fn whiten(&self) {
        self.color.store(MarkColor::White as u8, Ordering::Release);
    }

    /// Reached in the current or last episode
    pub fn is_marked(&self) -> bool {
        self.color() != MarkColor::White
    }

    /// Collector-visible class
    pub fn class(&self) -> ObjectClass {
        self.class
    }

    /// Estimated size in bytes
    pub fn size(&self) -> usize {
        self.size
    }
}

/// Trait for GC-managed object bodies
pub trait GcTraceable: Send + Sync + 'static {
    /// Report every tagged value held by this object
    fn trace(&self, tracer: &mut dyn FnMut(TaggedValue));

    /// Report references into the companion VM's heap (XRef objects only)
    fn trace_xref(&self, _tracer: &mut dyn FnMut(TaggedValue)) {}

    /// Collector-visible class
    fn class(&self) -> ObjectClass {
        ObjectClass::Ordinary
    }

    /// Estimated size in bytes
    fn heap_size(&self) -> usize {
        std::mem::size_of_val(self)
    }

    /// Downcasting support
    fn as_any(&self) -> &dyn Any;
}

/// A header plus its body, as stored in a heap slot.
pub struct HeapObject {
    header: GcHeader,
    body: Box<dyn GcTraceable>,
}

impl HeapObject {
    pub(crate) fn new(body: Box<dyn GcTraceable>) -> Self {
        Self {
            header: GcHeader::new(body.class(), body.heap_size()),
            body,
        }
    }

    /// The object's header
    pub fn header(&self) -> &GcHeader {
        &self.header
    }

    /// The object's body
    pub fn body(&self) -> &dyn GcTraceable {
        self.body.as_ref()
    }

    /// Downcast the body
    pub fn downcast<T: GcTraceable>(&self) -> Option<&T> {
        self.body.as_any().downcast_ref::<T>()
    }
}

impl std::fmt::Debug for HeapObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapObject")
            .field("color", &self.header.color())
            .field("class", &self.header.class())
            .finish()
    }
}

/// Typed handle to a heap object whose body is a `T`.
///
/// The body type is checked once, at construction.
pub struct GcRef<T> {
    cell: Arc<HeapObject>,
    reference: ObjectRef,
    _marker: PhantomData<fn() -> T>,
}

impl<T: GcTraceable> GcRef<T> {
    /// Wrap `cell` if its body is a `T`
    pub fn new(reference: ObjectRef, cell: Arc<HeapObject>) -> Option<Self> {
        cell.downcast::<T>()?;
        Some(Self {
            cell,
            reference,
            _marker: PhantomData,
        })
    }

    /// Address of the object
    pub fn reference(&self) -> ObjectRef {
        self.reference
    }

    /// The object as a tagged value
    pub fn value(&self) -> TaggedValue {
        TaggedValue::object(self.reference)
    }

    /// The object's header
    pub fn header(&self) -> &GcHeader {
        self.cell.header()
    }
}

impl<T: GcTraceable> std::ops::Deref for GcRef<T> {
    type Target = T;

    fn deref(&self) -> &T {
        match self.cell.downcast::<T>() {
            Some(body) => body,
            None => unreachable!("GcRef body type is checked at construction"),
        }
    }
}

impl<T> Clone for GcRef<T> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
            reference: self.reference,
            _marker: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for GcRef<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "GcRef({}:{})", self.reference.heap.0, self.reference.index)
    }
}

/// A plain record of tagged fields.
#[derive(Default)]
pub struct RecordObject {
    fields: RwLock<Vec<TaggedValue>>,
}

impl RecordObject {
    /// Create a record holding `fields`
    pub fn new(fields: Vec<TaggedValue>) -> Self {
        Self {
            fields: RwLock::new(fields),
        }
    }

    /// Read field `index`
    pub fn get(&self, index: usize) -> Option<TaggedValue> {
        self.fields.read().get(index).copied()
    }

    /// Overwrite field `index`, growing the record with `undefined` if needed
    pub fn set(&self, index: usize, value: TaggedValue) {
        let mut fields = self.fields.write();
        if index >= fields.len() {
            fields.resize(index + 1, TaggedValue::undefined());
        }
        fields[index] = value;
    }

    /// Append a field
    pub fn push(&self, value: TaggedValue) {
        self.fields.write().push(value);
    }

    /// Number of fields
    pub fn len(&self) -> usize {
        self.fields.read().len()
    }

    /// Whether the record has no fields
    pub fn is_empty(&self) -> bool {
        self.fields.read().is_empty()
    }
}

impl GcTraceable for RecordObject {
    fn trace(&self, tracer: &mut dyn FnMut(TaggedValue)) {
        for value in self.fields.read().iter() {
            tracer(*value);
        }
    }

    fn heap_size(&self) -> usize {
        std::mem::size_of::<Self>() + self.len() * std::mem::size_of::<TaggedValue>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// An object that pins a value living in the companion VM's heap.
///
/// Local fields are traced normally; the foreign reference is only ever
/// handed to the companion, never dereferenced here.
pub struct XRefObject {
    local: RecordObject,
    foreign: RwLock<TaggedValue>,
}

impl XRefObject {
    /// Create an XRef object pointing at `foreign`
    pub fn new(foreign: TaggedValue, local_fields: Vec<TaggedValue>) -> Self {
        Self {
            local: RecordObject::new(local_fields),
            foreign: RwLock::new(foreign),
        }
    }

    /// The foreign reference
    pub fn foreign(&self) -> TaggedValue {
        *self.foreign.read()
    }

    /// Retarget the foreign reference
    pub fn set_foreign(&self, value: TaggedValue) {
        *self.foreign.write() = value;
    }

    /// Local fields
    pub fn local(&self) -> &RecordObject {
        &self.local
    }
}

impl GcTraceable for XRefObject {
    fn trace(&self, tracer: &mut dyn FnMut(TaggedValue)) {
        self.local.trace(tracer);
    }

    fn trace_xref(&self, tracer: &mut dyn FnMut(TaggedValue)) {
        tracer(self.foreign());
    }

    fn class(&self) -> ObjectClass {
        ObjectClass::XRef
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
