//! Conversion of arrays into the shared-cache (uncounted) domain
//!
//! An uncounted array is a deep copy living in memory obtained from a
//! [`SharedAllocator`]. It has its own atomic reference count, never holds a
//! reference into counted memory, and is preceded by a prefix of
//! [`uncounted_alloc_extra`] bytes. Every block allocated here is matched by
//! exactly one free of the same size and address, and by one increment and
//! one decrement of the process-wide [`SharedCacheStats`].

use std::alloc::{handle_alloc_error, Layout};
use std::fmt::{self, Debug, Formatter};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::OnceLock;

use hashbrown::HashMap;

use crate::alloc::{shared_layout, SharedAllocator, SystemSharedAllocator, SHARED_ALIGN};
use crate::array::Array;
use crate::bespoke::BespokeArray;
use crate::header::{ArrayData, ArrayKind, RefCountMode};
use crate::vanilla::VanillaArray;
use crate::value::TypedValue;

/// Size of the prefix reserved in front of an uncounted array.
///
/// A pure function of its inputs: release recomputes it from the kind and
/// the has-shared-entry bit stored in the header.
pub const fn uncounted_alloc_extra(kind: ArrayKind, has_shared_entry: bool) -> usize {
    let mut extra = 0;
    if has_shared_entry {
        extra += 16;
    }
    if matches!(
        kind,
        ArrayKind::Mixed | ArrayKind::Dict | ArrayKind::BespokeDArray | ArrayKind::BespokeDict
    ) {
        extra += 16;
    }
    (extra + SHARED_ALIGN - 1) & !(SHARED_ALIGN - 1)
}

/// Process-wide count of live uncounted blocks.
#[derive(Debug, Default)]
pub struct SharedCacheStats {
    blocks: AtomicI64,
}

static STATS: OnceLock<SharedCacheStats> = OnceLock::new();

impl SharedCacheStats {
    /// Creates a standalone counter.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide counter, created on first call.
    pub fn create() -> &'static SharedCacheStats {
        STATS.get_or_init(SharedCacheStats::new)
    }

    /// The process-wide counter, if it was created.
    pub fn get() -> Option<&'static SharedCacheStats> {
        STATS.get()
    }

    /// Records a new uncounted block.
    pub fn add_uncounted_block(&self) {
        self.blocks.fetch_add(1, Ordering::Relaxed);
    }

    /// Records the release of an uncounted block.
    pub fn remove_uncounted_block(&self) {
        let prev = self.blocks.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "uncounted block count went negative");
    }

    /// Number of live uncounted blocks.
    pub fn uncounted_blocks(&self) -> i64 {
        self.blocks.load(Ordering::Relaxed)
    }
}

/// The allocator and accounting used by one conversion or release.
#[derive(Copy, Clone)]
pub struct UncountedHeap<'a> {
    allocator: &'a dyn SharedAllocator,
    stats: Option<&'a SharedCacheStats>,
}

static SYSTEM: SystemSharedAllocator = SystemSharedAllocator;

impl<'a> UncountedHeap<'a> {
    /// Bundles an allocator with optional accounting.
    pub fn new(allocator: &'a dyn SharedAllocator, stats: Option<&'a SharedCacheStats>) -> Self {
        Self { allocator, stats }
    }

    /// The global allocator, with the process-wide stats if they exist.
    pub fn global() -> UncountedHeap<'static> {
        UncountedHeap::new(&SYSTEM, SharedCacheStats::get())
    }

    /// Allocates `size` bytes aligned to [`SHARED_ALIGN`]. Failure aborts
    /// through the allocation error handler.
    pub fn allocate(&self, size: usize) -> NonNull<u8> {
        match self.allocator.allocate(size) {
            Ok(ptr) => ptr,
            Err(err) => {
                tracing::error!(target: "bespoke::uncounted", size, %err, "shared allocation failed");
                handle_alloc_error(shared_layout(size).unwrap_or_else(|_| Layout::new::<u8>()))
            }
        }
    }

    /// Frees a block.
    ///
    /// # Safety
    /// `ptr` and `size` must match an earlier call to
    /// [`UncountedHeap::allocate`] on the same allocator.
    pub unsafe fn free(&self, ptr: NonNull<u8>, size: usize) {
        self.allocator.free(ptr, size)
    }

    /// Counts a new uncounted block, if accounting is enabled.
    pub fn add_uncounted_block(&self) {
        if let Some(stats) = self.stats {
            stats.add_uncounted_block();
        }
    }

    /// Counts a released uncounted block, if accounting is enabled.
    pub fn remove_uncounted_block(&self) {
        if let Some(stats) = self.stats {
            stats.remove_uncounted_block();
        }
    }
}

impl Debug for UncountedHeap<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("UncountedHeap")
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

/// Identity map from counted arrays to their uncounted counterparts, scoped
/// to one conversion call tree.
pub trait DedupMap {
    /// The counterpart already produced for `counted`, if any.
    fn lookup(&self, counted: NonNull<ArrayData>) -> Option<NonNull<ArrayData>>;

    /// Remembers the counterpart of `counted`.
    fn record(&mut self, counted: NonNull<ArrayData>, uncounted: NonNull<ArrayData>);
}

/// Address-keyed [`DedupMap`].
#[derive(Debug, Default)]
pub struct SeenMap {
    map: HashMap<usize, NonNull<ArrayData>>,
}

impl SeenMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of recorded conversions.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns true if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl DedupMap for SeenMap {
    fn lookup(&self, counted: NonNull<ArrayData>) -> Option<NonNull<ArrayData>> {
        self.map.get(&(counted.as_ptr() as usize)).copied()
    }

    fn record(&mut self, counted: NonNull<ArrayData>, uncounted: NonNull<ArrayData>) {
        self.map.insert(counted.as_ptr() as usize, uncounted);
    }
}

/// Short reborrow of an optional map, for passing it down the call tree.
pub(crate) fn reborrow<'r>(seen: &'r mut Option<&mut dyn DedupMap>) -> Option<&'r mut dyn DedupMap> {
    match seen {
        Some(map) => Some(&mut **map),
        None => None,
    }
}

/// Looks `ad` up in the map and takes a reference to the counterpart found.
/// A counterpart already being torn down on another thread is skipped, so
/// the caller converts afresh and overwrites the stale entry.
pub(crate) fn reuse_seen(
    ad: NonNull<ArrayData>,
    seen: &Option<&mut dyn DedupMap>,
) -> Option<NonNull<ArrayData>> {
    let existing = seen.as_ref()?.lookup(ad)?;
    // Safety: a recorded counterpart's header stays readable until the map
    // entry is replaced
    let hd = unsafe { existing.as_ref() };
    if !hd.uncounted_inc_ref() {
        tracing::debug!(target: "bespoke::uncounted", src = ?ad, dst = ?existing, "stale dedup entry");
        return None;
    }
    tracing::trace!(target: "bespoke::uncounted", src = ?ad, dst = ?existing, "reused uncounted copy");
    Some(existing)
}

/// Converts a value for storage inside an uncounted array: nested arrays are
/// converted, everything else is copied.
pub fn to_uncounted_value(
    value: &TypedValue,
    heap: &UncountedHeap<'_>,
    seen: Option<&mut dyn DedupMap>,
) -> TypedValue {
    match value {
        TypedValue::Arr(array) => {
            // Safety: `array` holds a reference for the duration of the call
            let converted = unsafe { make_uncounted_array(array.as_ptr(), false, heap, seen) };
            // Safety: uncounted and static handles do not touch the count
            TypedValue::Arr(unsafe { Array::from_raw(converted) })
        }
        other => other.clone(),
    }
}

/// Releases a value taken out of an uncounted array.
///
/// # Safety
/// `value` must have been produced by [`to_uncounted_value`] on a heap with
/// the same allocator as `heap`.
pub unsafe fn release_uncounted_value(value: TypedValue, heap: &UncountedHeap<'_>) {
    if let TypedValue::Arr(array) = value {
        release_uncounted_array(array.into_raw(), heap);
    }
}

/// Uncounted counterpart of any array. Static arrays are returned as is,
/// uncounted ones gain a reference, counted ones are converted.
///
/// # Safety
/// `ad` must be a live array the caller holds a reference to.
pub unsafe fn make_uncounted_array(
    ad: NonNull<ArrayData>,
    has_shared_entry: bool,
    heap: &UncountedHeap<'_>,
    seen: Option<&mut dyn DedupMap>,
) -> NonNull<ArrayData> {
    let hd = ad.as_ref();
    match hd.mode() {
        RefCountMode::Static => ad,
        RefCountMode::Uncounted => {
            always_assert!(hd.uncounted_inc_ref(), "uncounted array {:p} already released", hd);
            ad
        }
        RefCountMode::Counted if hd.is_vanilla() => {
            VanillaArray::make_uncounted(ad, has_shared_entry, heap, seen)
        }
        RefCountMode::Counted => BespokeArray::make_uncounted(ad, has_shared_entry, heap, seen),
    }
}

/// Drops a reference to an array of the uncounted or static domain.
///
/// # Safety
/// `ad` must come from [`make_uncounted_array`] on a heap with the same
/// allocator as `heap`, and the reference being dropped must be owned.
pub unsafe fn release_uncounted_array(ad: NonNull<ArrayData>, heap: &UncountedHeap<'_>) {
    let hd = ad.as_ref();
    match hd.mode() {
        RefCountMode::Static => {}
        RefCountMode::Counted => fatal!("release_uncounted_array on counted array {:p}", hd),
        RefCountMode::Uncounted if hd.is_vanilla() => VanillaArray::release_uncounted(ad, heap),
        RefCountMode::Uncounted => BespokeArray::release_uncounted(ad, heap),
    }
}

impl BespokeArray {
    /// Deep copy of a counted bespoke array into the shared cache.
    ///
    /// # Safety
    /// `ad` must be a live counted bespoke array the caller holds a
    /// reference to.
    pub unsafe fn make_uncounted(
        ad: NonNull<ArrayData>,
        has_shared_entry: bool,
        heap: &UncountedHeap<'_>,
        mut seen: Option<&mut dyn DedupMap>,
    ) -> NonNull<ArrayData> {
        let hd = ad.as_ref();
        let bad = Self::as_bespoke(hd);
        always_assert!(
            hd.is_ref_counted(),
            "make_uncounted on {:?} bespoke array {:p}",
            hd.mode(),
            hd
        );
        let update_seen = seen.is_some() && hd.has_multiple_refs();
        if update_seen {
            if let Some(existing) = reuse_seen(ad, &seen) {
                return existing;
            }
        }

        let layout = bad.layout();
        let kind = hd.kind();
        let extra = uncounted_alloc_extra(kind, has_shared_entry);
        let bytes = bad.heap_size();
        let mem = heap.allocate(extra + bytes);
        let result = NonNull::new_unchecked(mem.as_ptr().add(extra)).cast::<ArrayData>();
        ptr::copy_nonoverlapping(ad.as_ptr().cast::<u8>(), result.as_ptr().cast::<u8>(), bytes);

        let mut aux = hd.aux16() & !ArrayData::HAS_SHARED_ENTRY;
        if has_shared_entry {
            aux |= ArrayData::HAS_SHARED_ENTRY;
        }
        (*result.as_ptr()).init_header_16(kind, RefCountMode::Uncounted, aux);
        (layout.vtable().convert_to_uncounted)(result, heap, reborrow(&mut seen));

        if update_seen {
            if let Some(seen) = seen {
                seen.record(ad, result);
            }
        }
        heap.add_uncounted_block();
        tracing::trace!(
            target: "bespoke::uncounted",
            layout = layout.name(),
            bytes,
            extra,
            "converted to uncounted"
        );
        result
    }

    /// Drops a reference to an uncounted bespoke array, tearing it down and
    /// freeing its block at zero.
    ///
    /// # Safety
    /// `ad` must come from [`BespokeArray::make_uncounted`] on a heap with
    /// the same allocator as `heap`, and the reference must be owned.
    pub unsafe fn release_uncounted(ad: NonNull<ArrayData>, heap: &UncountedHeap<'_>) {
        let hd = ad.as_ref();
        always_assert!(
            hd.is_uncounted(),
            "release_uncounted on {:?} bespoke array {:p}",
            hd.mode(),
            hd
        );
        if !hd.uncounted_dec_ref() {
            return;
        }
        let bad = Self::as_bespoke(hd);
        let layout = bad.layout();
        let extra = uncounted_alloc_extra(hd.kind(), hd.has_shared_entry());
        let bytes = bad.heap_size();

        (layout.vtable().release_uncounted)(ad, heap);
        heap.remove_uncounted_block();
        heap.free(
            NonNull::new_unchecked(ad.as_ptr().cast::<u8>().sub(extra)),
            extra + bytes,
        );
        tracing::trace!(
            target: "bespoke::uncounted",
            layout = layout.name(),
            bytes,
            extra,
            "released uncounted"
        );
    }
}

/// Handle to an array in the uncounted or static domain.
///
/// Unlike [`Array`], it may cross threads. Dropping it does nothing; the
/// reference it owns is given back with [`SharedArray::release`].
#[repr(transparent)]
pub struct SharedArray(NonNull<ArrayData>);

// Safety: uncounted and static arrays use atomic counts only and are never
// mutated after conversion
unsafe impl Send for SharedArray {}
unsafe impl Sync for SharedArray {}

impl SharedArray {
    /// Read access through the generic handle. Cloning the result takes an
    /// uncounted reference of its own.
    pub fn as_array(&self) -> &Array {
        // Safety: both are transparent wrappers around the same pointer, and
        // the borrow cannot outlive the reference we own
        unsafe { &*(self as *const SharedArray).cast::<Array>() }
    }

    /// Takes over the reference held by an owned handle to an uncounted or
    /// static array, so it can be given back through a heap. Counted arrays
    /// are handed back unchanged.
    pub fn try_from_array(array: Array) -> Result<SharedArray, Array> {
        if array.header().is_ref_counted() {
            Err(array)
        } else {
            Ok(SharedArray(array.into_raw()))
        }
    }

    /// The object header.
    pub fn header(&self) -> &ArrayData {
        // Safety: we own a reference
        unsafe { self.0.as_ref() }
    }

    /// The uncounted reference count.
    pub fn ref_count(&self) -> u32 {
        self.header().ref_count()
    }

    /// Takes another reference. Fails if the array is being torn down.
    pub fn try_clone(&self) -> Option<SharedArray> {
        let hd = self.header();
        if hd.is_static() || hd.uncounted_inc_ref() {
            Some(SharedArray(self.0))
        } else {
            None
        }
    }

    /// Gives the reference back.
    pub fn release(self, heap: &UncountedHeap<'_>) {
        // Safety: we own one reference, obtained from `heap`'s allocator
        unsafe { release_uncounted_array(self.0, heap) }
    }
}

impl Debug for SharedArray {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Debug::fmt(self.as_array(), f)
    }
}

/// Converts `array` for the shared cache with a fresh dedup map.
pub fn convert_to_shared(
    array: &Array,
    has_shared_entry: bool,
    heap: &UncountedHeap<'_>,
) -> SharedArray {
    let mut seen = SeenMap::new();
    convert_to_shared_with(array, has_shared_entry, heap, &mut seen)
}

/// Converts `array` for the shared cache, deduplicating through `seen`.
pub fn convert_to_shared_with(
    array: &Array,
    has_shared_entry: bool,
    heap: &UncountedHeap<'_>,
    seen: &mut dyn DedupMap,
) -> SharedArray {
    // Safety: `array` holds a reference for the duration of the call
    SharedArray(unsafe { make_uncounted_array(array.as_ptr(), has_shared_entry, heap, Some(seen)) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging_array::{LoggingArray, LoggingProfile};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn alloc_extra_is_aligned_and_deterministic() {
        assert_eq!(uncounted_alloc_extra(ArrayKind::Vec, false), 0);
        assert_eq!(uncounted_alloc_extra(ArrayKind::Vec, true), 16);
        assert_eq!(uncounted_alloc_extra(ArrayKind::Dict, false), 16);
        assert_eq!(uncounted_alloc_extra(ArrayKind::BespokeDict, true), 32);
        assert_eq!(uncounted_alloc_extra(ArrayKind::Keyset, true) % SHARED_ALIGN, 0);
    }

    #[mockalloc::test]
    fn vanilla_conversion_is_symmetric() {
        let stats = SharedCacheStats::new();
        let heap = UncountedHeap::new(&SYSTEM, Some(&stats));
        let a = Array::dict([("a", 1), ("b", 2)]);
        let shared = convert_to_shared(&a, true, &heap);
        assert!(shared.header().is_uncounted());
        assert!(shared.header().has_shared_entry());
        assert_eq!(shared.as_array(), &a);
        assert_eq!(stats.uncounted_blocks(), 1);
        shared.release(&heap);
        assert_eq!(stats.uncounted_blocks(), 0);
    }

    #[mockalloc::test]
    fn shared_sub_arrays_are_converted_once() {
        let stats = SharedCacheStats::new();
        let heap = UncountedHeap::new(&SYSTEM, Some(&stats));
        let inner = Array::vec([1, 2]);
        let outer = Array::vec([inner.clone(), inner.clone()]);

        let mut seen = SeenMap::new();
        let shared = convert_to_shared_with(&outer, false, &heap, &mut seen);
        assert_eq!(seen.len(), 1);
        assert_eq!(stats.uncounted_blocks(), 2);

        {
            let first = shared.as_array().get_int(0);
            let second = shared.as_array().get_int(1);
            let (first, second) = (first.as_array().unwrap(), second.as_array().unwrap());
            assert!(first.ptr_eq(second));
            assert!(first.header().is_uncounted());
            // two slots plus the two handles read out of them
            assert_eq!(first.ref_count(), 4);
        }

        shared.release(&heap);
        assert_eq!(stats.uncounted_blocks(), 0);
        assert_eq!(inner.ref_count(), 3);
    }

    #[mockalloc::test]
    fn cloned_handle_outlives_release() {
        let stats = SharedCacheStats::new();
        let heap = UncountedHeap::new(&SYSTEM, Some(&stats));
        let shared = convert_to_shared(&Array::vec([1, 2]), false, &heap);
        let escaped = shared.as_array().clone();
        assert_eq!(shared.ref_count(), 2);
        shared.release(&heap);
        assert_eq!(stats.uncounted_blocks(), 1);
        assert_eq!(escaped.get_int(1), TypedValue::Int(2));

        let owned = SharedArray::try_from_array(escaped).expect("uncounted handle");
        owned.release(&heap);
        assert_eq!(stats.uncounted_blocks(), 0);
    }

    #[test]
    fn counted_handle_is_not_adopted() {
        let a = Array::vec([1]);
        let a = SharedArray::try_from_array(a).expect_err("counted handle");
        assert!(a.is_unique());
    }

    #[mockalloc::test]
    fn without_map_each_path_gets_its_own_copy() {
        let stats = SharedCacheStats::new();
        let heap = UncountedHeap::new(&SYSTEM, Some(&stats));
        let inner = Array::vec([1]);
        let outer = Array::vec([inner.clone(), inner]);
        // Safety: `outer` holds a reference
        let ad = unsafe { make_uncounted_array(outer.as_ptr(), false, &heap, None) };
        assert_eq!(stats.uncounted_blocks(), 3);
        unsafe { release_uncounted_array(ad, &heap) };
        assert_eq!(stats.uncounted_blocks(), 0);
    }

    #[mockalloc::test]
    fn stale_dedup_entry_is_replaced() {
        let heap = UncountedHeap::new(&SYSTEM, None);
        let a = Array::vec([1, 2]);
        let other = a.clone();
        let dying = ArrayData::new(ArrayKind::Vec, RefCountMode::Uncounted, 0);
        assert!(dying.uncounted_dec_ref());
        let dying_ptr = NonNull::from(&dying);

        let mut seen = SeenMap::new();
        seen.record(a.as_ptr(), dying_ptr);
        let shared = convert_to_shared_with(&a, false, &heap, &mut seen);
        assert_ne!(shared.as_array().as_ptr(), dying_ptr);
        assert_eq!(shared.ref_count(), 1);
        assert_eq!(shared.as_array(), &other);
        assert_eq!(seen.lookup(a.as_ptr()), Some(shared.as_array().as_ptr()));
        assert_eq!(dying.ref_count(), 0);
        shared.release(&heap);
    }

    #[mockalloc::test]
    fn unique_arrays_skip_the_map() {
        let heap = UncountedHeap::new(&SYSTEM, None);
        let inner = Array::vec([1]);
        let outer = Array::vec([inner]);
        let mut seen = SeenMap::new();
        let shared = convert_to_shared_with(&outer, false, &heap, &mut seen);
        assert!(seen.is_empty());
        shared.release(&heap);
    }

    #[mockalloc::test]
    fn uncounted_input_gains_a_reference() {
        let heap = UncountedHeap::new(&SYSTEM, None);
        let shared = convert_to_shared(&Array::vec([1]), false, &heap);
        let again = convert_to_shared(shared.as_array(), false, &heap);
        assert_eq!(shared.ref_count(), 2);
        again.release(&heap);
        assert_eq!(shared.ref_count(), 1);
        shared.release(&heap);
    }

    #[test]
    fn static_input_is_used_as_is() {
        let heap = UncountedHeap::new(&SYSTEM, None);
        let s = Array::vec([1]).into_static();
        let shared = convert_to_shared(&s, false, &heap);
        assert!(shared.as_array().ptr_eq(&s));
        shared.release(&heap);
    }

    #[test]
    fn bespoke_conversion_converts_wrapped_array() {
        let stats = SharedCacheStats::new();
        let heap = UncountedHeap::new(&SYSTEM, Some(&stats));
        let profile = LoggingProfile::new("uncounted");
        let a = LoggingArray::make(Array::dict([("k", 1)]), profile.clone());
        let shared = convert_to_shared(&a, false, &heap);
        assert!(shared.as_array().is_bespoke());
        assert!(shared.header().is_uncounted());
        let wrapped = LoggingArray::as_logging(shared.header()).wrapped();
        assert!(wrapped.header().is_uncounted());
        assert_eq!(shared.as_array().get_str("k"), TypedValue::Int(1));
        assert_eq!(stats.uncounted_blocks(), 2);
        assert_eq!(Arc::strong_count(&profile), 3);

        shared.release(&heap);
        assert_eq!(stats.uncounted_blocks(), 0);
        assert_eq!(Arc::strong_count(&profile), 2);
    }

    #[test]
    fn concurrent_release_frees_once() {
        let stats = SharedCacheStats::new();
        let heap = UncountedHeap::new(&SYSTEM, Some(&stats));
        let shared = convert_to_shared(&Array::vec([1, 2, 3]), false, &heap);
        let clones: Vec<_> = (0..8).filter_map(|_| shared.try_clone()).collect();
        assert_eq!(shared.ref_count(), 9);
        thread::scope(|scope| {
            for clone in clones {
                let heap = &heap;
                scope.spawn(move || {
                    assert_eq!(clone.as_array().size(), 3);
                    clone.release(heap);
                });
            }
        });
        assert_eq!(stats.uncounted_blocks(), 1);
        shared.release(&heap);
        assert_eq!(stats.uncounted_blocks(), 0);
    }
}
