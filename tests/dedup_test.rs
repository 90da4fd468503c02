//! Shared-cache conversion of nested arrays, checked against a recording
//! allocator: every block must be freed exactly once with the size and
//! address it was allocated with.

mod common;

use std::thread;

use bespoke_array::{
    convert_to_shared, convert_to_shared_with, uncounted_alloc_extra, Array, ArrayKind,
    BespokeArray, LoggingArray, LoggingProfile, SeenMap, SharedArray, SharedCacheStats,
    TypedValue, UncountedHeap,
};
use common::{int_vec, AllocEvent, RecordingAllocator};

#[test]
fn shared_sub_array_is_allocated_once() {
    let alloc = RecordingAllocator::new();
    let stats = SharedCacheStats::new();
    let heap = UncountedHeap::new(&alloc, Some(&stats));

    let inner = int_vec::make(&[1, 2, 3]);
    let outer = Array::dict([("a", inner.clone()), ("b", inner.clone())]);
    let mut seen = SeenMap::new();
    let shared = convert_to_shared_with(&outer, false, &heap, &mut seen);

    assert_eq!(alloc.allocations(), 2);
    assert_eq!(seen.len(), 1);
    assert_eq!(stats.uncounted_blocks(), 2);
    {
        let a = shared.as_array().get_str("a");
        let b = shared.as_array().get_str("b");
        let (a, b) = (a.as_array().unwrap(), b.as_array().unwrap());
        assert!(a.ptr_eq(b));
        assert!(a.header().is_uncounted());
        assert!(int_vec::is_int_vec(a));
        assert_eq!(a.ref_count(), 4);
        assert_eq!(a.get_int(2), TypedValue::Int(3));
    }

    shared.release(&heap);
    assert_eq!(stats.uncounted_blocks(), 0);
    alloc.assert_balanced();
    assert_eq!(inner.ref_count(), 3);
}

#[test]
fn bespoke_block_carries_the_prefix() {
    let alloc = RecordingAllocator::new();
    let heap = UncountedHeap::new(&alloc, None);

    let a = int_vec::make(&[7]);
    let bytes = BespokeArray::as_bespoke(a.header()).heap_size();
    let extra = uncounted_alloc_extra(ArrayKind::BespokeVec, true);
    assert_eq!(extra, 16);

    let shared = convert_to_shared(&a, true, &heap);
    assert!(shared.header().has_shared_entry());
    assert!(!shared.header().is_sampled_array());
    assert_eq!(shared.header().kind(), ArrayKind::BespokeVec);
    assert_eq!(
        BespokeArray::as_bespoke(shared.header()).layout_index(),
        int_vec::index()
    );
    let addr = shared.header() as *const _ as usize;
    shared.release(&heap);

    assert_eq!(
        alloc.events(),
        vec![
            AllocEvent::Alloc {
                addr: addr - extra,
                size: extra + bytes,
            },
            AllocEvent::Free {
                addr: addr - extra,
                size: extra + bytes,
            },
        ]
    );
}

#[test]
fn nested_logging_array_is_deduplicated() {
    let alloc = RecordingAllocator::new();
    let stats = SharedCacheStats::new();
    let heap = UncountedHeap::new(&alloc, Some(&stats));

    let profile = LoggingProfile::new("dedup");
    let logged = LoggingArray::make(Array::vec([1, 2]), profile.clone());
    let outer = Array::vec([logged.clone(), logged.clone(), int_vec::make(&[4]).into()]);
    let shared = convert_to_shared(&outer, false, &heap);

    // outer, the wrapper, its wrapped vec, and the unshared IntVec
    assert_eq!(alloc.allocations(), 4);
    assert_eq!(stats.uncounted_blocks(), 4);
    {
        let first = shared.as_array().get_int(0);
        let second = shared.as_array().get_int(1);
        let first = first.as_array().unwrap();
        assert!(first.ptr_eq(second.as_array().unwrap()));
        assert!(first.is_bespoke());
        assert_eq!(first.ref_count(), 4);
        assert_eq!(first.get_int(1), TypedValue::Int(2));
    }

    shared.release(&heap);
    assert_eq!(stats.uncounted_blocks(), 0);
    alloc.assert_balanced();
    assert_eq!(logged.ref_count(), 3);
    assert_eq!(std::sync::Arc::strong_count(&profile), 2);
}

#[test]
fn deep_nesting_converts_every_level() {
    let alloc = RecordingAllocator::new();
    let heap = UncountedHeap::new(&alloc, None);
    let mut array = int_vec::make(&[0]);
    for depth in 0..5 {
        array = Array::dict([("child", TypedValue::from(array)), ("depth", depth.into())]);
    }
    let shared = convert_to_shared(&array, false, &heap);
    assert_eq!(alloc.allocations(), 6);
    shared.release(&heap);
    alloc.assert_balanced();
}

#[test]
fn concurrent_release_frees_once() {
    let alloc = RecordingAllocator::new();
    let stats = SharedCacheStats::new();
    let heap = UncountedHeap::new(&alloc, Some(&stats));
    let inner = int_vec::make(&[1, 2]);
    let outer = Array::vec([inner.clone(), inner]);
    let shared = convert_to_shared(&outer, false, &heap);

    let clones: Vec<_> = (0..16).filter_map(|_| shared.try_clone()).collect();
    assert_eq!(clones.len(), 16);
    thread::scope(|scope| {
        for clone in clones {
            let heap = &heap;
            scope.spawn(move || {
                assert_eq!(clone.as_array().size(), 2);
                clone.release(heap);
            });
        }
    });
    assert_eq!(shared.ref_count(), 1);
    assert_eq!(stats.uncounted_blocks(), 2);
    shared.release(&heap);
    assert_eq!(stats.uncounted_blocks(), 0);
    alloc.assert_balanced();
}

#[test]
fn global_heap_tracks_blocks() {
    let stats = SharedCacheStats::get().expect("stats enabled by default");
    let heap = UncountedHeap::global();
    let before = stats.uncounted_blocks();
    let shared = convert_to_shared(&int_vec::make(&[1]), false, &heap);
    assert_eq!(stats.uncounted_blocks(), before + 1);
    shared.release(&heap);
    assert_eq!(stats.uncounted_blocks(), before);
}

fn frees(alloc: &RecordingAllocator) -> usize {
    alloc
        .events()
        .iter()
        .filter(|e| matches!(e, AllocEvent::Free { .. }))
        .count()
}

#[test]
fn cloned_handle_keeps_the_block_alive() {
    let alloc = RecordingAllocator::new();
    let heap = UncountedHeap::new(&alloc, None);
    let shared = convert_to_shared(&Array::vec([1, 2]), false, &heap);
    let escaped = shared.as_array().clone();
    shared.release(&heap);

    assert_eq!(frees(&alloc), 0);
    assert_eq!(escaped.size(), 2);
    assert_eq!(escaped.get_int(1), TypedValue::Int(2));
    SharedArray::try_from_array(escaped)
        .expect("uncounted handle")
        .release(&heap);
    alloc.assert_balanced();
}

#[test]
fn nested_value_outlives_its_parent() {
    let alloc = RecordingAllocator::new();
    let heap = UncountedHeap::new(&alloc, None);
    let outer = Array::dict([("child", int_vec::make(&[5, 6]))]);
    let shared = convert_to_shared(&outer, false, &heap);
    let child = match shared.as_array().get_str("child") {
        TypedValue::Arr(array) => array,
        other => panic!("unexpected {:?}", other),
    };
    shared.release(&heap);

    assert_eq!(frees(&alloc), 1);
    assert!(int_vec::is_int_vec(&child));
    assert_eq!(child.get_int(1), TypedValue::Int(6));
    SharedArray::try_from_array(child)
        .expect("uncounted handle")
        .release(&heap);
    alloc.assert_balanced();
}

#[test]
#[should_panic(expected = "dropped without its heap")]
fn dropping_the_last_uncounted_handle_is_fatal() {
    let alloc = RecordingAllocator::new();
    let heap = UncountedHeap::new(&alloc, None);
    let shared = convert_to_shared(&Array::vec([1]), false, &heap);
    let escaped = shared.as_array().clone();
    shared.release(&heap);
    drop(escaped);
}
