//! Property-based tests: the engine against a `BTreeMap` model, plus the
//! structural invariants after arbitrary operation sequences.

use std::collections::BTreeMap;

use bptr::{Engine, Key};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Insert(u64, u64),
    Delete(u64),
    Find(u64),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0u64..200, any::<u64>()).prop_map(|(k, v)| Op::Insert(k, v)),
        2 => (0u64..200).prop_map(Op::Delete),
        1 => (0u64..200).prop_map(Op::Find),
    ]
}

fn open_engine() -> (tempfile::TempDir, Engine) {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::open(dir.path().join("store.db")).unwrap();
    (dir, engine)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn engine_matches_btreemap_model(ops in prop::collection::vec(arb_op(), 1..400)) {
        let (_dir, engine) = open_engine();
        let root = engine.create_root().unwrap();
        let mut model: BTreeMap<u64, u64> = BTreeMap::new();

        for op in ops {
            match op {
                Op::Insert(k, v) => {
                    engine.insert(root, k, v).unwrap();
                    model.insert(k, v);
                }
                Op::Delete(k) => {
                    let deleted = engine.delete(root, k).unwrap();
                    prop_assert_eq!(deleted, model.remove(&k).is_some());
                }
                Op::Find(k) => {
                    prop_assert_eq!(engine.find(root, k).unwrap(), model.get(&k).copied());
                }
            }
        }

        prop_assert_eq!(engine.count(root).unwrap(), model.len() as u64);

        let mut scanned = Vec::new();
        engine.find_range(root, 0u64, u64::MAX, |key, value| {
            scanned.push((key.k1, value));
            true
        }).unwrap();
        let expected: Vec<(u64, u64)> = model.iter().map(|(&k, &v)| (k, v)).collect();
        prop_assert_eq!(scanned, expected);

        engine.check_consistency().unwrap();
    }

    #[test]
    fn scan_respects_bounds_and_order(
        keys in prop::collection::hash_set(any::<u64>(), 1..300),
        bound_a in any::<u64>(),
        bound_b in any::<u64>(),
    ) {
        let (lo, hi) = if bound_a <= bound_b { (bound_a, bound_b) } else { (bound_b, bound_a) };

        let (_dir, engine) = open_engine();
        let root = engine.create_root().unwrap();
        for &k in &keys {
            engine.insert(root, k, k.wrapping_mul(3)).unwrap();
        }

        let mut scanned = Vec::new();
        engine.find_range(root, lo, hi, |key, value| {
            scanned.push((key.k1, value));
            true
        }).unwrap();

        for window in scanned.windows(2) {
            prop_assert!(window[0].0 < window[1].0, "scan must ascend strictly");
        }
        let mut sorted: Vec<u64> = keys.iter().copied().filter(|&k| lo <= k && k <= hi).collect();
        sorted.sort_unstable();
        let expected: Vec<(u64, u64)> =
            sorted.into_iter().map(|k| (k, k.wrapping_mul(3))).collect();
        prop_assert_eq!(scanned, expected);
    }

    #[test]
    fn delete_completeness_in_any_order(
        order in prop::collection::hash_set(any::<u64>(), 1..300)
            .prop_map(|set| set.into_iter().collect::<Vec<u64>>())
            .prop_shuffle(),
    ) {
        let (_dir, engine) = open_engine();
        let root = engine.create_root().unwrap();

        let mut sorted = order.clone();
        sorted.sort_unstable();
        for &k in &sorted {
            engine.insert(root, k, k).unwrap();
        }

        for &k in &order {
            prop_assert!(engine.delete(root, k).unwrap(), "key {} must delete", k);
        }

        prop_assert_eq!(engine.count(root).unwrap(), 0);
        for &k in &order {
            prop_assert_eq!(engine.find(root, k).unwrap(), None);
        }

        let report = engine.check_consistency().unwrap();
        prop_assert_eq!(report.reachable_pages, 0);
        prop_assert_eq!(report.leaked_pages, 0);

        // The tree must be fully usable after a teardown.
        for k in 0..50u64 {
            engine.insert(root, k, k + 1).unwrap();
        }
        prop_assert_eq!(engine.count(root).unwrap(), 50);
    }

    #[test]
    fn root_operations_are_isolated(
        keys_a in prop::collection::hash_set(0u64..1000, 1..100),
        keys_b in prop::collection::hash_set(0u64..1000, 1..100),
    ) {
        let (_dir, engine) = open_engine();
        let a = engine.create_root().unwrap();
        let b = engine.create_root().unwrap();

        for &k in &keys_a {
            engine.insert(a, k, k + 1).unwrap();
        }
        for &k in &keys_b {
            engine.insert(b, k, k + 2).unwrap();
        }
        for &k in &keys_a {
            engine.delete(a, k).unwrap();
        }

        prop_assert_eq!(engine.count(a).unwrap(), 0);
        prop_assert_eq!(engine.count(b).unwrap(), keys_b.len() as u64);
        for &k in &keys_b {
            prop_assert_eq!(engine.find(b, k).unwrap(), Some(k + 2));
        }
        engine.check_consistency().unwrap();
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn inserted_entries_survive_reopen(
        entries in prop::collection::btree_map(any::<u64>(), any::<u64>(), 1..300),
    ) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");

        {
            let engine = Engine::open(&path).unwrap();
            let root = engine.create_root().unwrap();
            for (&k, &v) in &entries {
                engine.insert(root, k, v).unwrap();
            }
            engine.flush().unwrap();
            engine.close().unwrap();
        }

        let engine = Engine::open(&path).unwrap();
        prop_assert_eq!(engine.count(0).unwrap(), entries.len() as u64);
        for (&k, &v) in &entries {
            prop_assert_eq!(engine.find(0, k).unwrap(), Some(v));
        }
    }

    #[test]
    fn composite_entries_match_model(
        entries in prop::collection::btree_map(
            (0u64..100, 0u64..4),
            any::<u64>(),
            1..150,
        ),
    ) {
        let (_dir, engine) = open_engine();
        let root = engine.create_root().unwrap();

        for (&(k1, k2), &v) in &entries {
            engine.insert(root, Key::new(k1, k2), v).unwrap();
        }

        for (&(k1, k2), &v) in &entries {
            prop_assert_eq!(engine.find(root, Key::new(k1, k2)).unwrap(), Some(v));
        }
        prop_assert_eq!(engine.count(root).unwrap(), entries.len() as u64);

        let mut scanned = Vec::new();
        engine.find_range(root, Key::MIN, Key::MAX, |key, value| {
            scanned.push(((key.k1, key.k2), value));
            true
        }).unwrap();
        let expected: Vec<((u64, u64), u64)> =
            entries.iter().map(|(&k, &v)| (k, v)).collect();
        prop_assert_eq!(scanned, expected);
    }
}
