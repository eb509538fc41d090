//! Set builtin tests
//!
//! Iteration order and iteration under self-mutation are checked against a
//! reference model: an append-only entry list where deleting empties a slot
//! and `clear` empties all of them. A live iteration visits the list front
//! to back, so it sees exactly the entries live when reached.

use otter_unified_gc::{EcmaVm, TaggedValue};
use otter_unified_vm::intrinsics_impl::set::{
    SetIterationItem, set_add, set_clear, set_constructor, set_delete, set_for_each, set_has, set_size,
    set_values,
};
use otter_unified_vm::{VmContext, VmResult};
use proptest::prelude::*;
use std::sync::Arc;

fn create_test_context() -> VmContext {
    VmContext::new(Arc::new(EcmaVm::with_defaults().unwrap()), "set-test")
}

fn int(n: i32) -> TaggedValue {
    TaggedValue::int32(n)
}

#[derive(Debug, Clone, Copy)]
enum Op {
    Add(i32),
    Delete(i32),
    Clear,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        6 => (0..12i32).prop_map(Op::Add),
        4 => (0..12i32).prop_map(Op::Delete),
        1 => Just(Op::Clear),
    ]
}

#[derive(Default)]
struct Model {
    entries: Vec<Option<i32>>,
}

impl Model {
    fn apply(&mut self, op: Op) {
        match op {
            Op::Add(v) => {
                if !self.entries.contains(&Some(v)) {
                    self.entries.push(Some(v));
                }
            }
            Op::Delete(v) => {
                if let Some(slot) = self.entries.iter_mut().find(|slot| **slot == Some(v)) {
                    *slot = None;
                }
            }
            Op::Clear => self.entries.iter_mut().for_each(|slot| *slot = None),
        }
    }

    fn live(&self) -> Vec<i32> {
        self.entries.iter().flatten().copied().collect()
    }

    /// Visit order when `batches[k]` runs after the k-th visit
    fn visit_with(&mut self, batches: &[Vec<Op>]) -> Vec<i32> {
        let mut visited = Vec::new();
        let mut index = 0;
        while index < self.entries.len() {
            if let Some(v) = self.entries[index] {
                let batch = batches.get(visited.len());
                visited.push(v);
                for op in batch.into_iter().flatten() {
                    self.apply(*op);
                }
            }
            index += 1;
        }
        visited
    }
}

/// Mutations interleaved with collections while an iterator is live
#[derive(Debug, Clone, Copy)]
enum HeapOp {
    /// Allocate a fresh object and add it
    Grow,
    /// Delete the n-th live member (modulo the live count)
    Delete(usize),
    Collect,
}

fn heap_op_strategy() -> impl Strategy<Value = HeapOp> {
    prop_oneof![
        3 => Just(HeapOp::Grow),
        2 => (0..16usize).prop_map(HeapOp::Delete),
        2 => Just(HeapOp::Collect),
    ]
}

fn new_object(ctx: &VmContext) -> TaggedValue {
    ctx.new_object(TaggedValue::null()).unwrap().value()
}

fn apply(ctx: &VmContext, set: TaggedValue, op: Op) -> VmResult<()> {
    match op {
        Op::Add(v) => set_add(ctx, set, int(v)).map(|_| ()),
        Op::Delete(v) => set_delete(ctx, set, int(v)).map(|_| ()),
        Op::Clear => set_clear(ctx, set),
    }
}

fn visit(ctx: &VmContext, set: TaggedValue) -> Vec<i32> {
    let mut seen = Vec::new();
    set_for_each(ctx, set, TaggedValue::undefined(), |_, call| {
        seen.push(call.value.as_int32().unwrap());
        Ok(())
    })
    .unwrap();
    seen
}

#[test]
fn test_for_each_order_after_delete() {
    let ctx = create_test_context();
    let set = set_constructor(&ctx, &[]).unwrap().value();
    for op in [Op::Add(1), Op::Add(2), Op::Delete(1), Op::Add(3)] {
        apply(&ctx, set, op).unwrap();
    }
    assert_eq!(visit(&ctx, set), [2, 3]);
}

#[test]
fn test_for_each_visits_value_added_mid_iteration() {
    let ctx = create_test_context();
    let set = set_constructor(&ctx, &[int(1), int(2), int(3)]).unwrap().value();
    let mut seen = Vec::new();
    set_for_each(&ctx, set, TaggedValue::undefined(), |ctx, call| {
        seen.push(call.value.as_int32().unwrap());
        if call.value == int(2) {
            set_add(ctx, call.set, int(4))?;
        }
        Ok(())
    })
    .unwrap();
    assert_eq!(seen, [1, 2, 3, 4]);
}

#[test]
fn test_readding_deleted_value_moves_it_last() {
    let ctx = create_test_context();
    let set = set_constructor(&ctx, &[int(1), int(2), int(3)]).unwrap().value();
    set_delete(&ctx, set, int(1)).unwrap();
    set_add(&ctx, set, int(1)).unwrap();
    assert_eq!(visit(&ctx, set), [2, 3, 1]);
    assert!(set_has(&ctx, set, int(1)).unwrap());
}

#[test]
fn test_large_set_round_trip_through_growth_and_shrink() {
    let ctx = create_test_context();
    let set = set_constructor(&ctx, &[]).unwrap().value();
    for n in 0..1000 {
        set_add(&ctx, set, int(n)).unwrap();
    }
    for n in (0..1000).filter(|n| n % 10 != 0) {
        assert!(set_delete(&ctx, set, int(n)).unwrap());
    }
    assert_eq!(set_size(&ctx, set).unwrap(), 100);
    assert_eq!(visit(&ctx, set), (0..1000).step_by(10).collect::<Vec<_>>());
}

#[test]
fn test_iterator_keeps_unreferenced_set_alive() {
    let ctx = create_test_context();
    let member = new_object(&ctx);
    let set = set_constructor(&ctx, &[member]).unwrap().value();
    let mut iter = set_values(&ctx, set).unwrap();

    ctx.collect_garbage().unwrap();
    assert_eq!(iter.next(), Some(SetIterationItem::Value(member)));
    assert!(ctx.object(member).is_some());
    // A fresh allocation must not land on a live member's slot
    let other = new_object(&ctx);
    assert_ne!(other, member);
    assert_eq!(iter.next(), None);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_for_each_matches_insertion_order(ops in prop::collection::vec(op_strategy(), 0..60)) {
        let ctx = create_test_context();
        let set = set_constructor(&ctx, &[]).unwrap().value();
        let mut model = Model::default();
        for op in &ops {
            apply(&ctx, set, *op).unwrap();
            model.apply(*op);
        }
        prop_assert_eq!(visit(&ctx, set), model.live());
        prop_assert_eq!(set_size(&ctx, set).unwrap(), model.live().len());
    }

    #[test]
    fn prop_for_each_under_self_mutation(
        initial in prop::collection::vec(0..12i32, 0..10),
        batches in prop::collection::vec(prop::collection::vec(op_strategy(), 0..4), 0..12),
    ) {
        let ctx = create_test_context();
        let values: Vec<TaggedValue> = initial.iter().map(|v| int(*v)).collect();
        let set = set_constructor(&ctx, &values).unwrap().value();
        let mut model = Model::default();
        for v in &initial {
            model.apply(Op::Add(*v));
        }
        let expected = model.visit_with(&batches);

        let mut seen = Vec::new();
        set_for_each(&ctx, set, TaggedValue::undefined(), |ctx, call| {
            if let Some(batch) = batches.get(seen.len()) {
                for op in batch {
                    apply(ctx, call.set, *op)?;
                }
            }
            seen.push(call.value.as_int32().unwrap());
            Ok(())
        }).unwrap();
        prop_assert_eq!(seen, expected);
        prop_assert_eq!(visit(&ctx, set), model.live());
    }

    #[test]
    fn prop_iterator_under_interleaved_mutation(
        initial in prop::collection::vec(0..12i32, 0..10),
        batches in prop::collection::vec(prop::collection::vec(op_strategy(), 0..4), 0..12),
    ) {
        let ctx = create_test_context();
        let values: Vec<TaggedValue> = initial.iter().map(|v| int(*v)).collect();
        let set = set_constructor(&ctx, &values).unwrap().value();
        let mut model = Model::default();
        for v in &initial {
            model.apply(Op::Add(*v));
        }
        let expected = model.visit_with(&batches);

        let mut seen = Vec::new();
        for item in set_values(&ctx, set).unwrap() {
            let SetIterationItem::Value(value) = item else {
                panic!("values() yielded an entry");
            };
            if let Some(batch) = batches.get(seen.len()) {
                for op in batch {
                    apply(&ctx, set, *op).unwrap();
                }
            }
            seen.push(value.as_int32().unwrap());
        }
        prop_assert_eq!(seen, expected);
    }

    #[test]
    fn prop_iterator_survives_collections(
        initial in 1usize..8,
        batches in prop::collection::vec(prop::collection::vec(heap_op_strategy(), 0..4), 0..12),
    ) {
        let ctx = create_test_context();
        let members: Vec<TaggedValue> = (0..initial).map(|_| new_object(&ctx)).collect();
        let set = set_constructor(&ctx, &members).unwrap().value();
        // Model: append-only entry list, `None` once deleted
        let mut entries: Vec<Option<TaggedValue>> = members.into_iter().map(Some).collect();
        let mut cursor = 0;

        // Only the iterator references the set from here on
        for (visited, item) in set_values(&ctx, set).unwrap().enumerate() {
            let SetIterationItem::Value(value) = item else {
                panic!("values() yielded an entry");
            };
            let position = (cursor..entries.len()).find(|i| entries[*i].is_some());
            prop_assert!(position.is_some(), "yielded {:?} past the live entries", value);
            let position = position.unwrap();
            prop_assert_eq!(Some(value), entries[position]);
            prop_assert!(ctx.object(value).is_some(), "yielded a swept object");
            cursor = position + 1;

            for op in batches.get(visited).into_iter().flatten() {
                match *op {
                    HeapOp::Grow => {
                        let value = new_object(&ctx);
                        set_add(&ctx, set, value).unwrap();
                        entries.push(Some(value));
                    }
                    HeapOp::Delete(n) => {
                        let live: Vec<usize> = (0..entries.len()).filter(|i| entries[*i].is_some()).collect();
                        if let Some(&index) = live.get(n % live.len().max(1)) {
                            prop_assert!(set_delete(&ctx, set, entries[index].unwrap()).unwrap());
                            entries[index] = None;
                        }
                    }
                    HeapOp::Collect => {
                        ctx.collect_garbage().unwrap();
                    }
                }
            }
        }
        prop_assert!(entries[cursor..].iter().all(Option::is_none));
    }
}
