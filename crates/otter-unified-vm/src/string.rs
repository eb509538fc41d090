//! Heap strings

use std::any::Any;
use std::sync::Arc;

use otter_unified_gc::{GcTraceable, TaggedValue};

/// An immutable string body.
///
/// Strings handed to builtins are interned per context, so two equal
/// strings are the same heap object.
#[derive(Debug)]
pub struct JsString {
    data: Arc<str>,
}

impl JsString {
    /// Create a string body
    pub fn new(data: impl Into<Arc<str>>) -> Self {
        Self { data: data.into() }
    }

    /// The string contents
    pub fn as_str(&self) -> &str {
        &self.data
    }

    /// Shared handle to the contents
    pub fn data(&self) -> &Arc<str> {
        &self.data
    }
}

impl GcTraceable for JsString {
    fn trace(&self, _tracer: &mut dyn FnMut(TaggedValue)) {}

    fn heap_size(&self) -> usize {
        std::mem::size_of::<Self>() + self.data.len()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
