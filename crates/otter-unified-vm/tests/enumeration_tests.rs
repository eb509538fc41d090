//! Property enumeration tests
//!
//! - `for-in` key order across prototype chains, nearest key wins
//! - Fast path and slow path agree on every chain the fast path accepts
//! - One dictionary-mode or indexed object anywhere on a chain disables
//!   the enum cache for the whole chain
//! - Proxy traps and their errors

use otter_unified_gc::{EcmaVm, GcRef, TaggedValue};
use otter_unified_vm::object::{JsObject, PropertyAttributes, PropertyDescriptor, PropertyKey, ProxyHandler};
use otter_unified_vm::property_accessor::{PropertyAccessor, enumerate_object_properties, object_keys};
use otter_unified_vm::{VmContext, VmError, VmResult};
use proptest::prelude::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

fn create_test_context() -> VmContext {
    VmContext::new(Arc::new(EcmaVm::with_defaults().unwrap()), "enumeration-test")
}

fn names(keys: &[PropertyKey]) -> Vec<String> {
    keys.iter().map(ToString::to_string).collect()
}

fn for_in(ctx: &VmContext, value: TaggedValue) -> Vec<String> {
    let mut iter = enumerate_object_properties(ctx, value).unwrap();
    names(&iter.collect_remaining(ctx).unwrap())
}

/// Receiver first; each link's prototype is the next one
fn build_chain(ctx: &VmContext, links: &[Vec<(&str, bool)>]) -> Vec<GcRef<JsObject>> {
    let mut prototype = TaggedValue::null();
    let mut objects = Vec::new();
    for link in links.iter().rev() {
        let object = ctx.new_object(prototype).unwrap();
        for (name, enumerable) in link {
            let attributes = if *enumerable {
                PropertyAttributes::data()
            } else {
                PropertyAttributes::hidden()
            };
            object.define_property(
                PropertyKey::string(name),
                PropertyDescriptor::data_with_attrs(TaggedValue::int32(1), attributes),
            );
        }
        prototype = object.value();
        objects.push(object);
    }
    objects.reverse();
    objects
}

/// Reference model: per link, enumerable keys no earlier link owns
fn expected_keys(links: &[Vec<(&str, bool)>]) -> Vec<String> {
    let mut owned_earlier: Vec<&str> = Vec::new();
    let mut out = Vec::new();
    for link in links {
        let mut latest: Vec<(&str, bool)> = Vec::new();
        for (name, enumerable) in link {
            match latest.iter_mut().find(|entry| entry.0 == *name) {
                Some(entry) => entry.1 = *enumerable,
                None => latest.push((*name, *enumerable)),
            }
        }
        for (name, enumerable) in &latest {
            if *enumerable && !owned_earlier.contains(name) {
                out.push(name.to_string());
            }
        }
        owned_earlier.extend(latest.iter().map(|(n, _)| *n));
    }
    out
}

// ============================================================================
// Ordering
// ============================================================================

#[test]
fn test_receiver_shadows_prototype() {
    let ctx = create_test_context();
    let chain = build_chain(&ctx, &[vec![("a", true)], vec![("a", true), ("b", true)]]);
    assert_eq!(for_in(&ctx, chain[0].value()), ["a", "b"]);
}

#[test]
fn test_indices_before_names() {
    let ctx = create_test_context();
    let obj = ctx.new_object(TaggedValue::null()).unwrap();
    obj.set("z".into(), TaggedValue::int32(1));
    obj.set(PropertyKey::Index(3), TaggedValue::int32(1));
    obj.set(PropertyKey::Index(1), TaggedValue::int32(1));
    assert_eq!(for_in(&ctx, obj.value()), ["1", "3", "z"]);
}

#[test]
fn test_cache_hit_for_same_shape() {
    let ctx = create_test_context();
    let chain = build_chain(&ctx, &[vec![("x", true)], vec![("p", true)]]);
    assert_eq!(for_in(&ctx, chain[0].value()), ["x", "p"]);
    assert_eq!(ctx.enum_cache().len(), 1);

    let sibling = ctx.new_object(chain[1].value()).unwrap();
    sibling.set("x".into(), TaggedValue::int32(5));
    assert!(ctx.enum_cache().try_get_enum_cache(&ctx, &sibling).is_some());
    assert_eq!(for_in(&ctx, sibling.value()), ["x", "p"]);
}

#[test]
fn test_prototype_mutation_invalidates_cache() {
    let ctx = create_test_context();
    let chain = build_chain(&ctx, &[vec![("x", true)], vec![("p", true)]]);
    assert_eq!(for_in(&ctx, chain[0].value()), ["x", "p"]);

    chain[1].set("q".into(), TaggedValue::int32(1));
    assert!(ctx.enum_cache().try_get_enum_cache(&ctx, &chain[0]).is_none());
    assert_eq!(for_in(&ctx, chain[0].value()), ["x", "p", "q"]);

    chain[1].set(PropertyKey::Index(0), TaggedValue::int32(1));
    assert!(ctx.enum_cache().try_get_enum_cache(&ctx, &chain[0]).is_none());
    assert_eq!(for_in(&ctx, chain[0].value()), ["x", "0", "p", "q"]);
}

#[test]
fn test_prototype_swap_invalidates_cache() {
    let ctx = create_test_context();
    let chain = build_chain(&ctx, &[vec![("x", true)], vec![("p", true)]]);
    assert_eq!(for_in(&ctx, chain[0].value()), ["x", "p"]);

    let other = build_chain(&ctx, &[vec![("r", true)]]);
    chain[0].set_prototype(other[0].value());
    assert_eq!(for_in(&ctx, chain[0].value()), ["x", "r"]);
}

#[test]
fn test_deleted_prototype_key_skipped_mid_loop() {
    let ctx = create_test_context();
    let chain = build_chain(&ctx, &[vec![("a", true)], vec![("b", true), ("c", true)]]);
    let mut iter = enumerate_object_properties(&ctx, chain[0].value()).unwrap();
    assert_eq!(iter.next(&ctx).unwrap(), Some(PropertyKey::from("a")));
    chain[1].delete(&"b".into());
    assert_eq!(names(&iter.collect_remaining(&ctx).unwrap()), ["c"]);
}

#[test]
fn test_added_key_not_visited_mid_loop() {
    let ctx = create_test_context();
    let obj = ctx.new_object(TaggedValue::null()).unwrap();
    obj.set("a".into(), TaggedValue::int32(1));
    let mut iter = enumerate_object_properties(&ctx, obj.value()).unwrap();
    obj.set("b".into(), TaggedValue::int32(1));
    assert_eq!(names(&iter.collect_remaining(&ctx).unwrap()), ["a"]);
}

// ============================================================================
// Poisoning
// ============================================================================

#[test]
fn test_dictionary_link_poisons_simple_receiver() {
    let ctx = create_test_context();
    let chain = build_chain(
        &ctx,
        &[vec![("r", true)], vec![("m", true)], vec![("a", true), ("b", true), ("c", true)]],
    );
    chain[2].delete(&"a".into());
    assert!(chain[2].is_dictionary_mode());

    let accessor = PropertyAccessor::new(&ctx, chain[0].clone()).unwrap();
    assert!(!accessor.can_use_enum_cache());
    assert!(!accessor.only_has_simple_properties());
    assert_eq!(names(&accessor.get_keys().unwrap()), ["r", "m", "b", "c"]);
    assert!(ctx.enum_cache().is_empty());
}

#[test]
fn test_indexed_prototype_poisons_simple_receiver() {
    let ctx = create_test_context();
    let chain = build_chain(&ctx, &[vec![("r", true)], vec![("p", true)]]);
    chain[1].set(PropertyKey::Index(2), TaggedValue::int32(1));
    let accessor = PropertyAccessor::new(&ctx, chain[0].clone()).unwrap();
    assert!(!accessor.can_use_enum_cache());
    assert_eq!(names(&accessor.get_keys().unwrap()), ["r", "2", "p"]);
    assert!(ctx.enum_cache().try_get_enum_cache(&ctx, &chain[0]).is_none());
}

// ============================================================================
// Proxies
// ============================================================================

struct RecordingProxy {
    keys: Vec<PropertyKey>,
    hidden: Vec<PropertyKey>,
    prototype: TaggedValue,
    fail_own_keys: bool,
    calls: AtomicUsize,
}

impl ProxyHandler for RecordingProxy {
    fn own_keys(&self, _ctx: &VmContext) -> VmResult<Vec<PropertyKey>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_own_keys {
            return Err(VmError::exception(TaggedValue::int32(13)));
        }
        Ok(self.keys.clone())
    }

    fn get_own_property(&self, _ctx: &VmContext, key: &PropertyKey) -> VmResult<Option<PropertyDescriptor>> {
        if !self.keys.contains(key) {
            return Ok(None);
        }
        let attributes = if self.hidden.contains(key) {
            PropertyAttributes::hidden()
        } else {
            PropertyAttributes::data()
        };
        Ok(Some(PropertyDescriptor::data_with_attrs(TaggedValue::int32(1), attributes)))
    }

    fn get_prototype(&self, _ctx: &VmContext) -> VmResult<TaggedValue> {
        Ok(self.prototype)
    }
}

fn proxy(keys: &[&str], hidden: &[&str], prototype: TaggedValue, fail_own_keys: bool) -> Arc<RecordingProxy> {
    Arc::new(RecordingProxy {
        keys: keys.iter().map(|k| PropertyKey::string(k)).collect(),
        hidden: hidden.iter().map(|k| PropertyKey::string(k)).collect(),
        prototype,
        fail_own_keys,
        calls: AtomicUsize::new(0),
    })
}

#[test]
fn test_proxy_on_chain_uses_slow_path() {
    let ctx = create_test_context();
    let base = build_chain(&ctx, &[vec![("a", true), ("z", true)]]);
    let handler = proxy(&["a", "p", "h", "p"], &["h"], base[0].value(), false);
    let middle = ctx.new_proxy(handler.clone()).unwrap();
    let receiver = ctx.new_object(middle.value()).unwrap();
    receiver.set("r".into(), TaggedValue::int32(1));

    let accessor = PropertyAccessor::new(&ctx, receiver.clone()).unwrap();
    assert!(!accessor.can_use_enum_cache());
    assert_eq!(accessor.chain_len(), 3);
    assert_eq!(names(&accessor.get_keys().unwrap()), ["r", "a", "p", "z"]);
    assert!(handler.calls.load(Ordering::SeqCst) >= 1);
}

#[test]
fn test_proxy_trap_error_aborts_enumeration() {
    let ctx = create_test_context();
    let handler = proxy(&["a"], &[], TaggedValue::null(), true);
    let middle = ctx.new_proxy(handler).unwrap();
    let receiver = ctx.new_object(middle.value()).unwrap();
    receiver.set("r".into(), TaggedValue::int32(1));

    let result = enumerate_object_properties(&ctx, receiver.value());
    assert!(matches!(result, Err(VmError::Exception(v)) if v == TaggedValue::int32(13)));
    assert!(object_keys(&ctx, middle.value()).is_err());
    assert_eq!(names(&object_keys(&ctx, receiver.value()).unwrap()), ["r"]);
}

#[test]
fn test_object_keys_through_proxy() {
    let ctx = create_test_context();
    let handler = proxy(&["a", "h", "b"], &["h"], TaggedValue::null(), false);
    let target = ctx.new_proxy(handler).unwrap();
    assert_eq!(names(&object_keys(&ctx, target.value()).unwrap()), ["a", "b"]);
}

// ============================================================================
// Property-based tests
// ============================================================================

const KEY_NAMES: [&str; 6] = ["a", "b", "c", "d", "e", "f"];

fn link_strategy() -> impl Strategy<Value = Vec<(usize, bool)>> {
    prop::collection::vec((0..KEY_NAMES.len(), prop::bool::weighted(0.8)), 0..5)
}

fn to_links(raw: &[Vec<(usize, bool)>]) -> Vec<Vec<(&'static str, bool)>> {
    raw.iter()
        .map(|link| link.iter().map(|(k, e)| (KEY_NAMES[*k], *e)).collect())
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_fast_and_slow_paths_agree(raw in prop::collection::vec(link_strategy(), 1..5)) {
        let ctx = create_test_context();
        let links = to_links(&raw);
        let chain = build_chain(&ctx, &links);
        let accessor = PropertyAccessor::new(&ctx, chain[0].clone()).unwrap();

        let slow = accessor.get_keys_slow().unwrap();
        prop_assert_eq!(names(&slow), expected_keys(&links));
        prop_assert_eq!(slow.len(), accessor.actual_key_length());
        if accessor.only_has_simple_properties() {
            prop_assert_eq!(accessor.get_keys_fast(), slow.clone());
        }
        prop_assert_eq!(accessor.get_keys().unwrap(), slow.clone());

        // Second run answers from the cache when allowed, with the same keys
        prop_assert_eq!(for_in(&ctx, chain[0].value()), names(&slow));
    }

    #[test]
    fn prop_one_hard_link_poisons_chain(
        raw in prop::collection::vec(link_strategy(), 1..5),
        hard_at in 0usize..5,
        use_elements in any::<bool>(),
    ) {
        let ctx = create_test_context();
        let mut links = to_links(&raw);
        let hard_at = hard_at % links.len();
        let chain = build_chain(&ctx, &links);

        if use_elements {
            chain[hard_at].set(PropertyKey::Index(0), TaggedValue::int32(1));
        } else {
            chain[hard_at].set("x".into(), TaggedValue::int32(1));
            chain[hard_at].set("y".into(), TaggedValue::int32(1));
            chain[hard_at].delete(&"x".into());
            prop_assert!(chain[hard_at].is_dictionary_mode());
            links[hard_at].push(("y", true));
        }

        let accessor = PropertyAccessor::new(&ctx, chain[0].clone()).unwrap();
        prop_assert!(!accessor.can_use_enum_cache());
        prop_assert!(!accessor.only_has_simple_properties());

        let mut expected = expected_keys(&links);
        if use_elements {
            // "0" is owned by the hard link only, so it is never shadowed;
            // it comes first within that link
            let before = expected_keys(&links[..hard_at]).len();
            expected.insert(before, "0".to_string());
        }
        prop_assert_eq!(names(&accessor.get_keys().unwrap()), expected);
        prop_assert!(ctx.enum_cache().is_empty());
    }
}
