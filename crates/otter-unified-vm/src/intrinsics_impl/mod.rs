//! Builtin implementations
//!
//! ## Current modules:
//! - `set` - Set constructor, prototype methods and iterators

pub mod set;
