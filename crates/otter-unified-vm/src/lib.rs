//! # Otter Unified VM
//!
//! The object model and builtins that sit on top of the unified collector.
//!
//! ## Design Principles
//!
//! - **Hidden classes**: objects share shapes; deleting a non-last property
//!   switches the object to dictionary mode
//! - **Shape-keyed enum cache**: `for-in` keys are cached per receiver shape
//!   and revalidated against the prototype chain on every hit
//! - **GC-resident collections**: `Set` storage is an insertion-ordered
//!   table whose old generations stay linked for live iterators

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod context;
pub mod enum_cache;
pub mod error;
pub mod intrinsics_impl;
pub mod linked_hash_set;
pub mod object;
pub mod property_accessor;
pub mod shape;
pub mod string;

pub use context::VmContext;
pub use enum_cache::{EnumCache, EnumCacheTable};
pub use error::{VmError, VmResult};
pub use intrinsics_impl::set::{JsSet, SetIterator};
pub use linked_hash_set::LinkedHashTable;
pub use object::{JsObject, PropertyAttributes, PropertyDescriptor, PropertyKey, ProxyHandler};
pub use property_accessor::{ForInIterator, PropertyAccessor, enumerate_object_properties, object_keys};
pub use shape::{Shape, ShapeId};
pub use string::JsString;
