//! Tagged values with NaN-boxing
//!
//! Every slot the collector looks at is a single 64-bit word. Doubles are
//! stored directly; everything else lives in the quiet-NaN space.
//!
//! ## Encoding Scheme
//!
//! ```text
//! - Double:     stored directly (NaN canonicalised to TAG_NAN)
//! - NaN:        0x7FFA_0000_0000_0000
//! - Integer:    0x7FF8_0001_XXXX_XXXX (32-bit signed in lower bits)
//! - Reference:  0x7FFC_HHHH_IIII_IIII (16-bit heap id, 32-bit slot index)
//! - Undefined:  0x7FF8_0000_0000_0000
//! - Null:       0x7FF8_0000_0000_0001
//! - True:       0x7FF8_0000_0000_0002
//! - False:      0x7FF8_0000_0000_0003
//! - Hole:       0x7FF8_0000_0000_0004
//! ```
//!
//! Only the reference tag may be dereferenced; the tag alone decides it.

use std::fmt;

const TAG_MASK: u64 = 0xFFFF_0000_0000_0000;
const PAYLOAD_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;

const TAG_UNDEFINED: u64 = 0x7FF8_0000_0000_0000;
const TAG_NULL: u64 = 0x7FF8_0000_0000_0001;
const TAG_TRUE: u64 = 0x7FF8_0000_0000_0002;
const TAG_FALSE: u64 = 0x7FF8_0000_0000_0003;
const TAG_HOLE: u64 = 0x7FF8_0000_0000_0004;
const TAG_NAN: u64 = 0x7FFA_0000_0000_0000;
const TAG_INT32: u64 = 0x7FF8_0001_0000_0000;
const TAG_REFERENCE: u64 = 0x7FFC_0000_0000_0000;

/// Identifier of one heap (a per-thread local heap or a VM's shared heap).
///
/// Ids are unique across the whole process, so a reference minted by a
/// companion VM never aliases one of ours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HeapId(pub u16);

/// Address of a heap object: owning heap plus slot index inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    /// Heap that owns the slot
    pub heap: HeapId,
    /// Slot index in the heap arena
    pub index: u32,
}

impl ObjectRef {
    /// Create a reference to `index` in `heap`
    pub const fn new(heap: HeapId, index: u32) -> Self {
        Self { heap, index }
    }

    fn to_payload(self) -> u64 {
        ((self.heap.0 as u64) << 32) | self.index as u64
    }

    fn from_payload(payload: u64) -> Self {
        Self {
            heap: HeapId((payload >> 32) as u16),
            index: payload as u32,
        }
    }
}

/// A 64-bit tagged word: an immediate or a reference to a heap object.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaggedValue(u64);

impl TaggedValue {
    /// `undefined`
    pub const fn undefined() -> Self {
        Self(TAG_UNDEFINED)
    }

    /// `null`
    pub const fn null() -> Self {
        Self(TAG_NULL)
    }

    /// Hole: an empty slot, distinct from "never occupied" only by context
    pub const fn hole() -> Self {
        Self(TAG_HOLE)
    }

    /// Boolean immediate
    pub const fn boolean(b: bool) -> Self {
        if b { Self(TAG_TRUE) } else { Self(TAG_FALSE) }
    }

    /// 32-bit integer immediate
    pub const fn int32(n: i32) -> Self {
        Self(TAG_INT32 | (n as u32 as u64))
    }

    /// Double immediate; every NaN collapses to one canonical bit pattern
    pub fn number(n: f64) -> Self {
        if n.is_nan() { Self(TAG_NAN) } else { Self(n.to_bits()) }
    }

    /// Reference to a heap object
    pub fn object(r: ObjectRef) -> Self {
        Self(TAG_REFERENCE | r.to_payload())
    }

    /// Raw bits (used for hashing and debugging)
    pub const fn to_bits(self) -> u64 {
        self.0
    }

    /// Whether dereferencing this value is legal
    #[inline]
    pub const fn is_heap_object(self) -> bool {
        self.0 & TAG_MASK == TAG_REFERENCE
    }

    /// The referenced object, if this is a heap reference
    #[inline]
    pub fn as_object_ref(self) -> Option<ObjectRef> {
        if self.is_heap_object() {
            Some(ObjectRef::from_payload(self.0 & PAYLOAD_MASK))
        } else {
            None
        }
    }

    /// Check for `undefined`
    pub const fn is_undefined(self) -> bool {
        self.0 == TAG_UNDEFINED
    }

    /// Check for `null`
    pub const fn is_null(self) -> bool {
        self.0 == TAG_NULL
    }

    /// Check for the hole marker
    pub const fn is_hole(self) -> bool {
        self.0 == TAG_HOLE
    }

    /// Boolean payload
    pub const fn as_boolean(self) -> Option<bool> {
        match self.0 {
            TAG_TRUE => Some(true),
            TAG_FALSE => Some(false),
            _ => None,
        }
    }

    /// Int32 payload
    pub const fn as_int32(self) -> Option<i32> {
        if self.0 & 0xFFFF_FFFF_0000_0000 == TAG_INT32 {
            Some(self.0 as u32 as i32)
        } else {
            None
        }
    }

    /// Whether this is a double (including NaN) or an int32
    pub fn is_number(self) -> bool {
        self.as_number().is_some()
    }

    /// Numeric payload of an int32 or double
    pub fn as_number(self) -> Option<f64> {
        if let Some(i) = self.as_int32() {
            return Some(i as f64);
        }
        if self.0 == TAG_NAN {
            return Some(f64::NAN);
        }
        let exponent_all_ones = self.0 & 0x7FF0_0000_0000_0000 == 0x7FF0_0000_0000_0000;
        let mantissa = self.0 & 0x000F_FFFF_FFFF_FFFF;
        if exponent_all_ones && mantissa != 0 {
            // Some other tag living in the NaN space
            None
        } else {
            Some(f64::from_bits(self.0))
        }
    }

    /// Canonical form for collection keys under SameValueZero:
    /// `-0` becomes `+0`, integral doubles become int32, NaN is canonical.
    pub fn normalize_key(self) -> Self {
        if self.as_int32().is_some() {
            return self;
        }
        match self.as_number() {
            Some(n) if n.is_nan() => Self(TAG_NAN),
            Some(n) if n == 0.0 => Self::int32(0),
            Some(n) if n.fract() == 0.0 && n >= i32::MIN as f64 && n <= i32::MAX as f64 => {
                Self::int32(n as i32)
            }
            _ => self,
        }
    }

    /// SameValueZero: strict equality, except NaN equals NaN and +0 equals -0.
    ///
    /// Heap references compare by identity; strings must be interned by the
    /// embedder for content equality to hold.
    pub fn same_value_zero(self, other: Self) -> bool {
        self.normalize_key() == other.normalize_key()
    }
}

impl Default for TaggedValue {
    fn default() -> Self {
        Self::undefined()
    }
}

impl From<ObjectRef> for TaggedValue {
    fn from(r: ObjectRef) -> Self {
        Self::object(r)
    }
}

impl fmt::Debug for TaggedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(r) = self.as_object_ref() {
            write!(f, "Ref({}:{})", r.heap.0, r.index)
        } else if self.is_undefined() {
            f.write_str("undefined")
        } else if self.is_null() {
            f.write_str("null")
        } else if self.is_hole() {
            f.write_str("hole")
        } else if let Some(b) = self.as_boolean() {
            write!(f, "{b}")
        } else if let Some(i) = self.as_int32() {
            write!(f, "{i}")
        } else if let Some(n) = self.as_number() {
            write!(f, "{n:?}")
        } else {
            write!(f, "Tagged({:#x})", self.0)
        }
    }
}
