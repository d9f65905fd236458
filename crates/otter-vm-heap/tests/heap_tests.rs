//! Heap integration tests
//!
//! End-to-end scenarios over the public heap API: property tables, array
//! abandonment, cycle collection, finalizer rescue, out-of-memory handling
//! and teardown.

use std::cell::Cell;
use std::rc::Rc;

use otter_vm_heap::header::object_flags;
use otter_vm_heap::{
    Compact, Heap, HeapConfig, HeapError, LimitAllocator, LongjmpKind, MsFlags, PropFlags, PropKey, PropValue,
    TaggedValue,
};
use otter_vm_heap::{LightFunc, NativeFnId};

fn heap() -> Heap {
    Heap::new(HeapConfig::default()).unwrap()
}

fn light(func: NativeFnId) -> TaggedValue {
    TaggedValue::LightFunc(LightFunc { func, flags: 0 })
}

#[test]
fn test_delete_then_insert_other_key() {
    let mut heap = heap();
    let obj = heap.alloc_object().unwrap();
    heap.put_str(obj, "x", TaggedValue::Number(1.0)).unwrap();
    let x = heap.prop_key("x").unwrap();
    assert!(heap.delete_prop(obj, x).unwrap());
    heap.put_str(obj, "y", TaggedValue::Number(2.0)).unwrap();

    assert_eq!(heap.get_str(obj, "x").unwrap(), None);
    assert_eq!(heap.get_str(obj, "y").unwrap(), Some(TaggedValue::Number(2.0)));
    heap.verify().unwrap();
}

#[test]
fn test_far_index_write_abandons_items() {
    let mut heap = heap();
    let arr = heap.alloc_array().unwrap();
    for i in 0..4 {
        heap.array_push(arr, TaggedValue::Number(f64::from(i))).unwrap();
    }
    assert!(heap.header(arr).unwrap().has(object_flags::ARRAY_ITEMS));

    let far = heap.push_string("far").unwrap();
    heap.put_prop(arr, PropKey::Index(1_000_000), TaggedValue::String(far))
        .unwrap();

    assert!(!heap.header(arr).unwrap().has(object_flags::ARRAY_ITEMS));
    assert!(heap.object(arr).unwrap().items().is_empty());
    for i in 0..4u32 {
        assert_eq!(
            heap.get_own_data(arr, PropKey::Index(i)).unwrap(),
            Some(TaggedValue::Number(f64::from(i)))
        );
    }
    assert_eq!(
        heap.get_own_data(arr, PropKey::Index(1_000_000)).unwrap(),
        Some(TaggedValue::String(far))
    );
    assert_eq!(heap.array_length(arr).unwrap(), 1_000_001);
    assert_eq!(heap.stats().array_abandons, 1);
    heap.verify().unwrap();
}

#[test]
fn test_cycle_survives_refcounting_until_mark_and_sweep() {
    let mut heap = heap();
    let a = heap.alloc_object().unwrap();
    let b = heap.alloc_object().unwrap();
    heap.put_str(a, "b", TaggedValue::Object(b)).unwrap();
    heap.put_str(b, "a", TaggedValue::Object(a)).unwrap();
    heap.set_top(0).unwrap();

    assert_eq!(heap.refcount(a).unwrap(), 1);
    assert_eq!(heap.refcount(b).unwrap(), 1);

    let before = heap.object_count();
    assert!(heap.mark_and_sweep(MsFlags::empty()));
    assert!(!heap.is_live(a));
    assert!(!heap.is_live(b));
    assert_eq!(heap.object_count(), before - 2);
    assert!(heap.stats().last_freed >= 2);
    heap.verify().unwrap();
}

#[test]
fn test_finalizer_rescues_object() {
    let mut heap = heap();
    let id = heap.register_native(|heap, this| {
        let stash = heap.stash();
        heap.put_str(stash, "saved", TaggedValue::Object(this))
    });
    let obj = heap.alloc_object().unwrap();
    heap.set_finalizer(obj, light(id)).unwrap();
    heap.set_top(0).unwrap();
    assert!(heap.is_live(obj));

    heap.mark_and_sweep(MsFlags::empty());
    assert!(heap.is_live(obj));
    assert!(heap.header(obj).unwrap().is_finalized());
    let stash = heap.stash();
    assert_eq!(heap.get_str(stash, "saved").unwrap(), Some(TaggedValue::Object(obj)));

    heap.mark_and_sweep(MsFlags::empty());
    assert!(heap.is_live(obj));
    assert!(!heap.header(obj).unwrap().is_finalized());
    assert_eq!(heap.stats().finalizers_run, 1);
    heap.verify().unwrap();

    // Dropping the rescue reference runs the finalizer again.
    let saved = heap.prop_key("saved").unwrap();
    heap.delete_prop(stash, saved).unwrap();
    heap.mark_and_sweep(MsFlags::empty());
    assert_eq!(heap.stats().finalizers_run, 2);
}

#[test]
fn test_no_marks_survive_a_cycle() {
    let mut heap = heap();
    let root = heap.alloc_object().unwrap();
    for i in 0..50 {
        let child = heap.alloc_object().unwrap();
        heap.put_str(root, &format!("c{i}"), TaggedValue::Object(child)).unwrap();
        heap.put_str(child, "parent", TaggedValue::Object(root)).unwrap();
        heap.pop().unwrap();
    }
    heap.mark_and_sweep(MsFlags::empty());
    heap.verify_lists().unwrap();
    assert!(heap.list_of(root).is_some());
    assert!(!heap.header(root).unwrap().is_reachable());
}

#[test]
fn test_mark_and_sweep_is_idempotent() {
    let mut heap = heap();
    let keep = heap.alloc_object().unwrap();
    for _ in 0..20 {
        let o = heap.alloc_object().unwrap();
        heap.put_str(o, "self", TaggedValue::Object(o)).unwrap();
        heap.pop().unwrap();
    }
    heap.put_str(keep, "n", TaggedValue::Number(1.0)).unwrap();

    heap.mark_and_sweep(MsFlags::empty());
    let first = heap.stats();
    assert!(first.last_freed >= 20);

    heap.mark_and_sweep(MsFlags::empty());
    let second = heap.stats();
    assert_eq!(second.last_freed, 0);
    assert_eq!(second.last_kept_objects, first.last_kept_objects);
    assert_eq!(second.last_kept_strings, first.last_kept_strings);
}

#[test]
fn test_refcounts_agree_with_graph_after_collection() {
    let mut heap = heap();
    let arr = heap.alloc_array().unwrap();
    for i in 0..100 {
        let o = heap.alloc_object().unwrap();
        heap.put_str(o, "owner", TaggedValue::Object(arr)).unwrap();
        heap.put_str(o, "i", TaggedValue::Number(f64::from(i))).unwrap();
        heap.array_push(arr, TaggedValue::Object(o)).unwrap();
        heap.pop().unwrap();
    }
    heap.set_array_length(arr, 40).unwrap();
    heap.verify().unwrap();

    heap.mark_and_sweep(MsFlags::empty());
    heap.verify().unwrap();

    heap.mark_and_sweep(MsFlags::EMERGENCY);
    heap.verify().unwrap();
    assert_eq!(heap.array_length(arr).unwrap(), 40);
}

#[test]
fn test_deep_chain_with_small_recursion_limit() {
    let config = HeapConfig {
        mark_recursion_limit: 2,
        ..HeapConfig::default()
    };
    let mut heap = Heap::new(config).unwrap();
    let head = heap.alloc_object().unwrap();
    let mut tail = head;
    for _ in 0..1000 {
        let next = heap.alloc_object().unwrap();
        heap.put_str(tail, "next", TaggedValue::Object(next)).unwrap();
        heap.pop().unwrap();
        tail = next;
    }
    heap.put_str(tail, "next", TaggedValue::Object(head)).unwrap();

    heap.mark_and_sweep(MsFlags::empty());
    assert!(heap.is_live(tail));
    heap.verify().unwrap();

    heap.set_top(0).unwrap();
    heap.mark_and_sweep(MsFlags::empty());
    assert!(!heap.is_live(head));
    assert!(!heap.is_live(tail));
    heap.verify().unwrap();
}

#[test]
fn test_garbage_under_memory_limit_is_collected() {
    let config = HeapConfig {
        memory_limit: Some(128 * 1024),
        voluntary_gc: false,
        ..HeapConfig::default()
    };
    let mut heap = Heap::new(config).unwrap();
    let base = heap.stack_len();
    for _ in 0..2000 {
        let a = heap.alloc_object().unwrap();
        let b = heap.alloc_object().unwrap();
        heap.put_str(a, "peer", TaggedValue::Object(b)).unwrap();
        heap.put_str(b, "peer", TaggedValue::Object(a)).unwrap();
        heap.set_top(base).unwrap();
    }
    assert!(heap.stats().collections > 0);
    assert!(heap.memory_in_use() <= 128 * 1024);
    heap.verify().unwrap();
}

#[test]
fn test_out_of_memory_is_reported() {
    let config = HeapConfig {
        memory_limit: Some(64 * 1024),
        ..HeapConfig::default()
    };
    let mut heap = Heap::new(config).unwrap();
    let base = heap.stack_len();
    let mut err = None;
    for _ in 0..100_000 {
        match heap.alloc_object() {
            Ok(_) => {}
            Err(e) => {
                err = Some(e);
                break;
            }
        }
    }
    let err = err.expect("limit never reached");
    assert!(err.is_alloc_failure());
    assert_eq!(err, HeapError::OutOfMemory);
    assert!(heap.stats().emergency_collections > 0);
    heap.verify().unwrap();

    heap.set_top(base).unwrap();
    heap.mark_and_sweep(MsFlags::empty());
    heap.alloc_object().unwrap();
    heap.verify().unwrap();
}

#[test]
fn test_custom_allocator() {
    let config = HeapConfig::default();
    let mut heap: Heap = Heap::with_allocator(config, Box::new(LimitAllocator::new(1 << 20))).unwrap();
    let obj = heap.alloc_object().unwrap();
    heap.put_str(obj, "k", TaggedValue::Boolean(true)).unwrap();
    assert_eq!(heap.get_str(obj, "k").unwrap(), Some(TaggedValue::Boolean(true)));
}

#[test]
fn test_compact_handles() {
    let mut heap = Heap::<Compact>::with_config(HeapConfig::default()).unwrap();
    let obj = heap.alloc_object().unwrap();
    heap.put_str(obj, "x", TaggedValue::Number(1.0)).unwrap();
    let x = heap.prop_key("x").unwrap();
    assert!(heap.delete_prop(obj, x).unwrap());
    heap.put_str(obj, "y", TaggedValue::Number(2.0)).unwrap();
    assert_eq!(heap.get_str(obj, "x").unwrap(), None);
    assert_eq!(heap.get_str(obj, "y").unwrap(), Some(TaggedValue::Number(2.0)));

    let a = heap.alloc_object().unwrap();
    heap.put_str(a, "me", TaggedValue::Object(a)).unwrap();
    heap.pop().unwrap();
    heap.mark_and_sweep(MsFlags::empty());
    assert!(!heap.is_live(a));
    heap.verify().unwrap();
}

#[test]
fn test_stale_handle_does_not_resolve() {
    let mut heap = heap();
    let obj = heap.alloc_object().unwrap();
    heap.pop().unwrap();
    assert!(!heap.is_live(obj));
    // Reuse the slot with a new cell.
    let _other = heap.alloc_object().unwrap();
    assert!(!heap.is_live(obj));
    assert_eq!(heap.object(obj).unwrap_err(), HeapError::InvalidRef);
    assert_eq!(heap.put_str(obj, "x", TaggedValue::Null).unwrap_err(), HeapError::InvalidRef);
}

#[test]
fn test_entry_growth_is_logarithmic() {
    let mut heap = heap();
    let obj = heap.alloc_object().unwrap();
    let before = heap.stats().prop_resizes;
    for i in 0..10_000 {
        heap.put_str(obj, &format!("key{i}"), TaggedValue::Number(f64::from(i))).unwrap();
    }
    let resizes = heap.stats().prop_resizes - before;
    assert!(resizes <= 80, "{resizes} resizes for 10000 keys");
    assert_eq!(heap.get_str(obj, "key9999").unwrap(), Some(TaggedValue::Number(9999.0)));
    assert_eq!(heap.get_str(obj, "key0").unwrap(), Some(TaggedValue::Number(0.0)));
}

#[test]
fn test_emergency_cycle_compacts_objects() {
    let mut heap = heap();
    let obj = heap.alloc_object().unwrap();
    for i in 0..64 {
        heap.put_str(obj, &format!("p{i}"), TaggedValue::Number(f64::from(i))).unwrap();
    }
    for i in 0..60 {
        let k = heap.prop_key(&format!("p{i}")).unwrap();
        heap.delete_prop(obj, k).unwrap();
    }
    assert!(heap.object(obj).unwrap().strprops().size() >= 64);

    heap.mark_and_sweep(MsFlags::EMERGENCY);
    assert_eq!(heap.object(obj).unwrap().strprops().size(), 4);
    for i in 60..64 {
        assert_eq!(
            heap.get_str(obj, &format!("p{i}")).unwrap(),
            Some(TaggedValue::Number(f64::from(i)))
        );
    }
    assert_eq!(heap.stats().emergency_collections, 1);
}

#[test]
fn test_lj_values_and_breakpoints_are_roots() {
    let mut heap = heap();
    let thrown = heap.alloc_object().unwrap();
    heap.put_str(thrown, "self", TaggedValue::Object(thrown)).unwrap();
    let file = heap.push_string("script.js").unwrap();
    heap.set_lj_values(LongjmpKind::Throw, TaggedValue::Object(thrown), TaggedValue::Undefined);
    let bp = heap.add_breakpoint(file, 10).unwrap();
    heap.set_top(0).unwrap();

    heap.mark_and_sweep(MsFlags::empty());
    assert!(heap.is_live(thrown));
    assert!(heap.is_live(file));
    assert_eq!(heap.breakpoints()[bp].line, 10);
    heap.verify().unwrap();

    heap.clear_lj();
    heap.remove_breakpoint(bp).unwrap();
    heap.mark_and_sweep(MsFlags::empty());
    assert!(!heap.is_live(thrown));
    assert!(!heap.is_live(file));
    heap.verify().unwrap();
}

#[test]
fn test_prevented_finalizers_stay_queued() {
    let mut heap = heap();
    let calls = Rc::new(Cell::new(0u32));
    let seen = calls.clone();
    let id = heap.register_native(move |_, _| {
        seen.set(seen.get() + 1);
        Ok(())
    });
    let obj = heap.alloc_object().unwrap();
    heap.set_finalizer(obj, light(id)).unwrap();
    heap.set_top(0).unwrap();

    heap.prevent_finalizers();
    heap.mark_and_sweep(MsFlags::empty());
    assert_eq!(calls.get(), 0);
    assert_eq!(heap.finalize_pending(), 1);
    heap.verify_lists().unwrap();

    heap.allow_finalizers();
    heap.mark_and_sweep(MsFlags::empty());
    assert_eq!(calls.get(), 1);
    assert_eq!(heap.finalize_pending(), 0);
    heap.mark_and_sweep(MsFlags::empty());
    assert!(!heap.is_live(obj));
}

#[test]
fn test_native_function_object_as_finalizer() {
    let mut heap = heap();
    let calls = Rc::new(Cell::new(0u32));
    let seen = calls.clone();
    let id = heap.register_native(move |_, _| {
        seen.set(seen.get() + 1);
        Ok(())
    });
    let func = heap.alloc_natfunc(id, 1).unwrap();
    let obj = heap.alloc_object().unwrap();
    heap.set_finalizer(obj, TaggedValue::Object(func)).unwrap();
    heap.pop().unwrap();

    heap.mark_and_sweep(MsFlags::empty());
    assert_eq!(calls.get(), 1);
    assert!(heap.is_live(func));
}

#[test]
fn test_shutdown_runs_finalizers_and_frees_everything() {
    let mut heap = heap();
    let calls = Rc::new(Cell::new(0u32));
    let seen = calls.clone();
    let id = heap.register_native(move |_, _| {
        seen.set(seen.get() + 1);
        Ok(())
    });
    // One reachable, one garbage, one in a cycle.
    let live = heap.alloc_object().unwrap();
    heap.set_finalizer(live, light(id)).unwrap();
    let garbage = heap.alloc_object().unwrap();
    heap.set_finalizer(garbage, light(id)).unwrap();
    heap.pop().unwrap();
    let cyclic = heap.alloc_object().unwrap();
    heap.put_str(cyclic, "me", TaggedValue::Object(cyclic)).unwrap();
    heap.set_finalizer(cyclic, light(id)).unwrap();
    heap.pop().unwrap();
    let buf = heap.alloc_dynamic_buffer(256).unwrap();
    heap.resize_buffer(buf, 4096).unwrap();
    heap.put_str(live, "buf", TaggedValue::Buffer(buf)).unwrap();

    let stats = heap.shutdown();
    assert_eq!(calls.get(), 3);
    assert_eq!(stats.finalizers_run, 3);
    assert_eq!(stats.bytes_in_use, 0);
}

#[test]
fn test_threads_and_activations_are_traced() {
    let mut heap = heap();
    let t = heap.alloc_thread().unwrap();
    let env = heap.alloc_object().unwrap();
    heap.push_to(t, TaggedValue::Object(env)).unwrap();
    // Only the thread's own stack keeps `env` alive now.
    heap.pop().unwrap();
    assert_eq!(heap.refcount(env).unwrap(), 1);

    heap.mark_and_sweep(MsFlags::empty());
    assert!(heap.is_live(env));
    heap.verify().unwrap();

    heap.set_top(0).unwrap();
    assert!(!heap.is_live(t));
    assert!(!heap.is_live(env));
    heap.verify().unwrap();
}

#[test]
fn test_finalize_list_temp_roots_are_rescanned() {
    for len in 1..=6 {
        let config = HeapConfig {
            mark_recursion_limit: 4,
            ..HeapConfig::default()
        };
        let mut heap = Heap::new(config).unwrap();
        let id = heap.register_native(|_, _| Ok(()));
        heap.prevent_finalizers();

        // Two finalizable objects, each owning a kid, joined into a cycle by
        // plain chains so one of them sits at the recursion limit.
        let fin = [heap.alloc_object().unwrap(), heap.alloc_object().unwrap()];
        let mut kids = Vec::new();
        for &f in &fin {
            heap.set_finalizer(f, light(id)).unwrap();
            let kid = heap.alloc_object().unwrap();
            heap.put_str(f, "kid", TaggedValue::Object(kid)).unwrap();
            kids.push(kid);
        }
        for i in 0..2 {
            let mut tail = fin[i];
            for _ in 0..len {
                let next = heap.alloc_object().unwrap();
                heap.put_str(tail, "next", TaggedValue::Object(next)).unwrap();
                tail = next;
            }
            heap.put_str(tail, "next", TaggedValue::Object(fin[1 - i])).unwrap();
        }
        heap.set_top(0).unwrap();

        heap.mark_and_sweep(MsFlags::empty());
        assert_eq!(heap.finalize_pending(), 2);
        heap.mark_and_sweep(MsFlags::empty());
        assert_eq!(heap.finalize_pending(), 2);
        for &kid in &kids {
            assert!(heap.is_live(kid), "kid freed with chain length {len}");
        }
        assert_eq!(heap.stats().finalizers_run, 0);
        heap.verify().unwrap();
        heap.allow_finalizers();
    }
}

#[test]
fn test_unrooted_keys_survive_collection_during_store() {
    let config = HeapConfig {
        trigger_mult: 0,
        trigger_add: 0,
        ..HeapConfig::default()
    };
    let mut heap = Heap::new(config).unwrap();
    let obj = heap.alloc_object().unwrap();
    let getter = heap.alloc_object().unwrap();

    for i in 0..40 {
        let k = heap.prop_key(&format!("x{i}")).unwrap();
        heap.put_prop(obj, k, TaggedValue::Number(f64::from(i))).unwrap();
    }
    let k = heap.prop_key("defined").unwrap();
    heap.define_prop(obj, k, PropValue::Data(TaggedValue::Number(-1.0)), PropFlags::ENUMERABLE)
        .unwrap();
    let k = heap.prop_key("acc").unwrap();
    heap.define_accessor(obj, k, Some(getter), None, PropFlags::CONFIGURABLE)
        .unwrap();
    assert!(heap.stats().collections > 0);

    for i in 0..40 {
        assert_eq!(
            heap.get_str(obj, &format!("x{i}")).unwrap(),
            Some(TaggedValue::Number(f64::from(i)))
        );
    }
    assert_eq!(heap.get_str(obj, "defined").unwrap(), Some(TaggedValue::Number(-1.0)));
    let k = heap.prop_key("acc").unwrap();
    let (value, attrs) = heap.get_own_prop(obj, k).unwrap().unwrap();
    assert_eq!(
        value,
        PropValue::Accessor {
            get: Some(getter),
            set: None
        }
    );
    assert!(attrs.contains(PropFlags::ACCESSOR));
    heap.verify().unwrap();
}

#[test]
fn test_collection_during_growth_keeps_tables_intact() {
    let config = HeapConfig {
        trigger_mult: 0,
        trigger_add: 0,
        ..HeapConfig::default()
    };
    let mut heap = Heap::new(config).unwrap();
    let arr = heap.alloc_array().unwrap();
    let mut items = Vec::new();
    for i in 0..48 {
        let k = heap.prop_key(&format!("name{i}")).unwrap();
        heap.put_prop(arr, k, TaggedValue::Number(f64::from(i))).unwrap();
        let item = heap.alloc_object().unwrap();
        heap.array_push(arr, TaggedValue::Object(item)).unwrap();
        heap.pop().unwrap();
        items.push(item);
    }

    assert!(heap.stats().collections > 0);
    assert!(heap.stats().prop_resizes > 0);
    assert!(heap.object(arr).unwrap().strprops().hash_size() > 0);
    assert!(heap.header(arr).unwrap().has(object_flags::ARRAY_ITEMS));
    assert_eq!(heap.array_length(arr).unwrap(), 48);
    for (i, &item) in items.iter().enumerate() {
        assert_eq!(
            heap.get_str(arr, &format!("name{i}")).unwrap(),
            Some(TaggedValue::Number(i as f64))
        );
        assert_eq!(
            heap.get_own_data(arr, PropKey::Index(i as u32)).unwrap(),
            Some(TaggedValue::Object(item))
        );
        assert!(heap.is_live(item));
    }
    heap.verify().unwrap();

    heap.mark_and_sweep(MsFlags::EMERGENCY);
    assert_eq!(heap.array_length(arr).unwrap(), 48);
    heap.verify().unwrap();
}

#[test]
fn test_refcounts_exact_after_refzero_reaches_finalizable_cycle() {
    let mut heap = heap();
    let calls = Rc::new(Cell::new(0u32));
    let seen = calls.clone();
    let id = heap.register_native(move |_, _| {
        seen.set(seen.get() + 1);
        Ok(())
    });

    // holder -> fin -> (c <-> d), holder -> plain
    let holder = heap.alloc_object().unwrap();
    let fin = heap.alloc_object().unwrap();
    heap.set_finalizer(fin, light(id)).unwrap();
    let c = heap.alloc_object().unwrap();
    let d = heap.alloc_object().unwrap();
    let plain = heap.alloc_object().unwrap();
    heap.put_str(c, "peer", TaggedValue::Object(d)).unwrap();
    heap.put_str(d, "peer", TaggedValue::Object(c)).unwrap();
    heap.put_str(fin, "c", TaggedValue::Object(c)).unwrap();
    heap.put_str(holder, "fin", TaggedValue::Object(fin)).unwrap();
    heap.put_str(holder, "plain", TaggedValue::Object(plain)).unwrap();
    heap.set_top(0).unwrap();

    assert!(!heap.is_live(holder));
    assert!(!heap.is_live(plain));
    assert!(heap.is_live(fin));
    assert_eq!(heap.refcount(fin).unwrap(), 0);
    assert_eq!(heap.refcount(c).unwrap(), 2);
    assert_eq!(heap.refcount(d).unwrap(), 1);
    heap.verify_refcounts().unwrap();
    heap.verify().unwrap();

    heap.mark_and_sweep(MsFlags::empty());
    assert_eq!(calls.get(), 1);
    heap.verify().unwrap();
    heap.mark_and_sweep(MsFlags::empty());
    assert!(!heap.is_live(fin));
    assert!(!heap.is_live(c));
    assert!(!heap.is_live(d));
    assert_eq!(calls.get(), 1);
    heap.verify().unwrap();
}
