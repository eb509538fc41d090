//! Set constructor and prototype methods
//!
//! Each `Set` is a heap object holding the live generation of its
//! [`LinkedHashTable`]. `forEach` and the iterators keep whichever table
//! they started on and catch up with rehashes through the table chain, so
//! callbacks may freely add and delete while iteration is in progress.

use parking_lot::RwLock;
use std::any::Any;
use std::sync::Arc;

use otter_unified_gc::{GcRef, GcTraceable, RootGuard, TaggedValue};

use crate::context::VmContext;
use crate::error::{VmError, VmResult};
use crate::linked_hash_set::{LinkedHashTable, MIN_CAPACITY};

/// Heap body of a `Set`
pub struct JsSet {
    table: RwLock<Arc<LinkedHashTable>>,
}

impl JsSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self {
            table: RwLock::new(LinkedHashTable::new(MIN_CAPACITY)),
        }
    }

    /// The live table
    pub fn table(&self) -> Arc<LinkedHashTable> {
        self.table.read().clone()
    }

    fn add(&self, value: TaggedValue) {
        let mut table = self.table.write();
        *table = table.add(value);
    }

    fn delete(&self, value: TaggedValue) -> bool {
        let mut table = self.table.write();
        let (removed, next) = table.delete(value);
        *table = next;
        removed
    }

    fn clear(&self) {
        let mut table = self.table.write();
        *table = table.clear();
    }

    /// Number of live values
    pub fn size(&self) -> usize {
        self.table.read().number_of_elements()
    }

    /// Whether `value` is a member
    pub fn has(&self, value: TaggedValue) -> bool {
        self.table.read().has(value)
    }
}

impl Default for JsSet {
    fn default() -> Self {
        Self::new()
    }
}

impl GcTraceable for JsSet {
    fn trace(&self, tracer: &mut dyn FnMut(TaggedValue)) {
        for value in self.table.read().keys() {
            tracer(value);
        }
    }

    fn heap_size(&self) -> usize {
        std::mem::size_of::<Self>() + self.table.read().capacity() * std::mem::size_of::<TaggedValue>() * 2
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl std::fmt::Debug for JsSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JsSet(size={})", self.size())
    }
}

fn this_set(ctx: &VmContext, this: TaggedValue, method: &str) -> VmResult<GcRef<JsSet>> {
    ctx.resolve::<JsSet>(this)
        .ok_or_else(|| VmError::incompatible_receiver(method))
}

/// `new Set(values)`
pub fn set_constructor(ctx: &VmContext, values: &[TaggedValue]) -> VmResult<GcRef<JsSet>> {
    let set = ctx.alloc(JsSet::new())?;
    for value in values {
        set.add(*value);
    }
    Ok(set)
}

/// `Set.prototype.add`: returns the receiver
pub fn set_add(ctx: &VmContext, this: TaggedValue, value: TaggedValue) -> VmResult<TaggedValue> {
    let set = this_set(ctx, this, "Set.prototype.add")?;
    ctx.heap().record_write(value);
    set.add(value);
    Ok(this)
}

/// `Set.prototype.has`
pub fn set_has(ctx: &VmContext, this: TaggedValue, value: TaggedValue) -> VmResult<bool> {
    Ok(this_set(ctx, this, "Set.prototype.has")?.has(value))
}

/// `Set.prototype.delete`
pub fn set_delete(ctx: &VmContext, this: TaggedValue, value: TaggedValue) -> VmResult<bool> {
    Ok(this_set(ctx, this, "Set.prototype.delete")?.delete(value))
}

/// `Set.prototype.clear`
pub fn set_clear(ctx: &VmContext, this: TaggedValue) -> VmResult<()> {
    this_set(ctx, this, "Set.prototype.clear")?.clear();
    Ok(())
}

/// `get Set.prototype.size`
pub fn set_size(ctx: &VmContext, this: TaggedValue) -> VmResult<usize> {
    ctx.resolve::<JsSet>(this)
        .map(|set| set.size())
        .ok_or_else(|| VmError::type_error("get Set.prototype.size called on incompatible receiver"))
}

/// Arguments of one `forEach` callback invocation
#[derive(Debug, Clone, Copy)]
pub struct ForEachCall {
    /// `thisArg` given to `forEach`
    pub this_arg: TaggedValue,
    /// The element
    pub value: TaggedValue,
    /// Same as `value` for sets
    pub key: TaggedValue,
    /// The set being iterated
    pub set: TaggedValue,
}

/// `Set.prototype.forEach`.
///
/// Visits every value live when reached, in insertion order, including
/// values the callback adds. Stops at the first callback error.
pub fn set_for_each<F>(ctx: &VmContext, this: TaggedValue, this_arg: TaggedValue, mut callback: F) -> VmResult<()>
where
    F: FnMut(&VmContext, ForEachCall) -> VmResult<()>,
{
    let set = this_set(ctx, this, "Set.prototype.forEach")?;
    let _root = ctx.root(this);
    let mut table = set.table();
    let mut index = 0;
    loop {
        (table, index) = table.latest(index);
        if index >= table.slot_count() {
            return Ok(());
        }
        let slot = table.key_at(index);
        index += 1;
        if let Some(value) = slot {
            callback(
                ctx,
                ForEachCall {
                    this_arg,
                    value,
                    key: value,
                    set: this,
                },
            )?;
        }
    }
}

/// What a Set iterator yields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationKind {
    /// `values()` and `keys()`
    Values,
    /// `entries()`: `[value, value]`
    Entries,
}

/// One step of a Set iterator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetIterationItem {
    /// From `values()` / `keys()`
    Value(TaggedValue),
    /// From `entries()`
    Entry(TaggedValue, TaggedValue),
}

/// `%SetIteratorPrototype%` state.
///
/// Keeps its set rooted until exhausted, so values it has yet to yield
/// survive a collection even when nothing else references the set.
#[derive(Debug)]
pub struct SetIterator {
    /// `None` once exhausted
    table: Option<Arc<LinkedHashTable>>,
    set_root: Option<RootGuard>,
    index: usize,
    kind: IterationKind,
}

impl SetIterator {
    /// Iteration kind
    pub fn kind(&self) -> IterationKind {
        self.kind
    }

    /// Whether the iterator has finished
    pub fn is_done(&self) -> bool {
        self.table.is_none()
    }
}

impl Iterator for SetIterator {
    type Item = SetIterationItem;

    fn next(&mut self) -> Option<SetIterationItem> {
        loop {
            let (table, index) = self.table.as_ref()?.latest(self.index);
            if index >= table.slot_count() {
                self.table = None;
                self.set_root = None;
                return None;
            }
            self.index = index + 1;
            let slot = table.key_at(index);
            self.table = Some(table);
            if let Some(value) = slot {
                return Some(match self.kind {
                    IterationKind::Values => SetIterationItem::Value(value),
                    IterationKind::Entries => SetIterationItem::Entry(value, value),
                });
            }
        }
    }
}

fn make_set_iterator(ctx: &VmContext, this: TaggedValue, method: &str, kind: IterationKind) -> VmResult<SetIterator> {
    let set = this_set(ctx, this, method)?;
    Ok(SetIterator {
        table: Some(set.table()),
        set_root: Some(ctx.root(this)),
        index: 0,
        kind,
    })
}

/// `Set.prototype.values`
pub fn set_values(ctx: &VmContext, this: TaggedValue) -> VmResult<SetIterator> {
    make_set_iterator(ctx, this, "Set.prototype.values", IterationKind::Values)
}

/// `Set.prototype.keys` (same as `values`)
pub fn set_keys(ctx: &VmContext, this: TaggedValue) -> VmResult<SetIterator> {
    make_set_iterator(ctx, this, "Set.prototype.keys", IterationKind::Values)
}

/// `Set.prototype.entries`
pub fn set_entries(ctx: &VmContext, this: TaggedValue) -> VmResult<SetIterator> {
    make_set_iterator(ctx, this, "Set.prototype.entries", IterationKind::Entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use otter_unified_gc::EcmaVm;

    fn context() -> VmContext {
        VmContext::new(Arc::new(EcmaVm::with_defaults().unwrap()), "test")
    }

    fn int(n: i32) -> TaggedValue {
        TaggedValue::int32(n)
    }

    fn visit(ctx: &VmContext, set: TaggedValue) -> Vec<TaggedValue> {
        let mut seen = Vec::new();
        set_for_each(ctx, set, TaggedValue::undefined(), |_, call| {
            seen.push(call.value);
            Ok(())
        })
        .unwrap();
        seen
    }

    #[test]
    fn test_order_after_delete() {
        let ctx = context();
        let set = set_constructor(&ctx, &[]).unwrap().value();
        set_add(&ctx, set, int(1)).unwrap();
        set_add(&ctx, set, int(2)).unwrap();
        set_delete(&ctx, set, int(1)).unwrap();
        set_add(&ctx, set, int(3)).unwrap();
        assert_eq!(visit(&ctx, set), vec![int(2), int(3)]);
        assert_eq!(set_size(&ctx, set).unwrap(), 2);
    }

    #[test]
    fn test_add_returns_receiver_and_dedups() {
        let ctx = context();
        let set = set_constructor(&ctx, &[int(1), int(1), TaggedValue::number(1.0)]).unwrap().value();
        assert_eq!(set_add(&ctx, set, int(1)).unwrap(), set);
        assert_eq!(set_size(&ctx, set).unwrap(), 1);
        assert!(set_has(&ctx, set, TaggedValue::number(1.0)).unwrap());
        assert!(!set_delete(&ctx, set, int(9)).unwrap());
    }

    #[test]
    fn test_interned_strings_compare_equal() {
        let ctx = context();
        let set = set_constructor(&ctx, &[]).unwrap().value();
        set_add(&ctx, set, ctx.intern("a").unwrap()).unwrap();
        set_add(&ctx, set, ctx.intern("a").unwrap()).unwrap();
        assert_eq!(set_size(&ctx, set).unwrap(), 1);
    }

    #[test]
    fn test_for_each_visits_added_value() {
        let ctx = context();
        let set = set_constructor(&ctx, &[int(1), int(2), int(3)]).unwrap().value();
        let mut seen = Vec::new();
        set_for_each(&ctx, set, TaggedValue::undefined(), |ctx, call| {
            seen.push(call.value);
            if call.value == int(2) {
                set_add(ctx, call.set, int(4))?;
            }
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![int(1), int(2), int(3), int(4)]);
    }

    #[test]
    fn test_for_each_delete_current_and_next() {
        let ctx = context();
        let set = set_constructor(&ctx, &[int(1), int(2), int(3), int(4)]).unwrap().value();
        let mut seen = Vec::new();
        set_for_each(&ctx, set, TaggedValue::undefined(), |ctx, call| {
            seen.push(call.value);
            if call.value == int(1) {
                set_delete(ctx, call.set, int(1))?;
                set_delete(ctx, call.set, int(2))?;
            }
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![int(1), int(3), int(4)]);
    }

    #[test]
    fn test_for_each_survives_rehash() {
        let ctx = context();
        let set = set_constructor(&ctx, &[int(0), int(1), int(2), int(3)]).unwrap().value();
        let mut seen = Vec::new();
        set_for_each(&ctx, set, TaggedValue::undefined(), |ctx, call| {
            seen.push(call.value);
            if call.value == int(1) {
                set_delete(ctx, call.set, int(0))?;
                for n in 10..20 {
                    set_add(ctx, call.set, int(n))?;
                }
            }
            Ok(())
        })
        .unwrap();
        let mut expected = vec![int(0), int(1), int(2), int(3)];
        expected.extend((10..20).map(int));
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_clear_during_for_each() {
        let ctx = context();
        let set = set_constructor(&ctx, &[int(1), int(2), int(3)]).unwrap().value();
        let mut seen = Vec::new();
        set_for_each(&ctx, set, TaggedValue::undefined(), |ctx, call| {
            seen.push(call.value);
            if call.value == int(1) {
                set_clear(ctx, call.set)?;
                set_add(ctx, call.set, int(7))?;
            }
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![int(1), int(7)]);
    }

    #[test]
    fn test_callback_error_stops_iteration() {
        let ctx = context();
        let set = set_constructor(&ctx, &[int(1), int(2)]).unwrap().value();
        let mut calls = 0;
        let result = set_for_each(&ctx, set, int(42), |_, call| {
            calls += 1;
            assert_eq!(call.this_arg, int(42));
            Err(VmError::exception(call.value))
        });
        assert!(matches!(result, Err(VmError::Exception(v)) if v == int(1)));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_incompatible_receiver() {
        let ctx = context();
        let object = ctx.new_object(TaggedValue::null()).unwrap().value();
        let err = set_add(&ctx, object, int(1)).unwrap_err();
        assert_eq!(
            err.to_string(),
            "TypeError: Method Set.prototype.add called on incompatible receiver"
        );
        assert!(set_size(&ctx, int(1)).is_err());
        assert!(set_values(&ctx, object).is_err());
    }

    #[test]
    fn test_iterator_sees_mutation() {
        let ctx = context();
        let set = set_constructor(&ctx, &[int(1), int(2)]).unwrap().value();
        let mut iter = set_entries(&ctx, set).unwrap();
        assert_eq!(iter.next(), Some(SetIterationItem::Entry(int(1), int(1))));
        set_delete(&ctx, set, int(2)).unwrap();
        for n in 3..10 {
            set_add(&ctx, set, int(n)).unwrap();
        }
        let rest: Vec<_> = iter.by_ref().collect();
        assert_eq!(rest.len(), 7);
        assert_eq!(rest[0], SetIterationItem::Entry(int(3), int(3)));
        assert!(iter.is_done());
        set_add(&ctx, set, int(100)).unwrap();
        assert_eq!(iter.next(), None);
    }

    #[test]
    fn test_set_values_survive_collection() {
        let ctx = context();
        let set = set_constructor(&ctx, &[]).unwrap();
        let _root = ctx.root(set.value());
        let member = ctx.new_object(TaggedValue::null()).unwrap().value();
        set_add(&ctx, set.value(), member).unwrap();
        ctx.collect_garbage().unwrap();
        assert!(ctx.object(member).is_some());
        assert_eq!(set_keys(&ctx, set.value()).unwrap().count(), 1);
    }

    #[test]
    fn test_iterator_roots_set_until_exhausted() {
        let ctx = context();
        let member = ctx.new_object(TaggedValue::null()).unwrap().value();
        let set = set_constructor(&ctx, &[member]).unwrap().value();
        let roots_before = ctx.heap().roots().len();

        let mut iter = set_values(&ctx, set).unwrap();
        assert_eq!(ctx.heap().roots().len(), roots_before + 1);
        ctx.collect_garbage().unwrap();
        assert_eq!(iter.next(), Some(SetIterationItem::Value(member)));
        assert!(ctx.object(member).is_some());

        assert_eq!(iter.next(), None);
        assert_eq!(ctx.heap().roots().len(), roots_before);
        ctx.collect_garbage().unwrap();
        assert!(ctx.object(member).is_none());
    }
}
