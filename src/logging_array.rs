//! The sampling layout
//!
//! A [`LoggingArray`] wraps a counted vanilla array and records every
//! operation performed on it into a shared [`LoggingProfile`]. It never
//! escalates on its own: mutations keep the wrapper and replace the wrapped
//! array. The wrapped array carries the sampled flag while the wrapper owns
//! it exclusively.

use std::mem;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::array::{release_ref, Array};
use crate::bespoke::BespokeArray;
use crate::error::BespokeError;
use crate::header::{ArrayData, ArrayKind, LayoutIndex};
use crate::layout::{LayoutFunctions, Pos};
use crate::options::RuntimeOptions;
use crate::sort::SortFunction;
use crate::uncounted::{make_uncounted_array, release_uncounted_array, DedupMap, UncountedHeap};
use crate::vanilla::VanillaArray;
use crate::value::{DataType, TypedValue};

/// Identifier of a compiled translation.
pub type TransId = u32;
/// Identifier of a source location.
pub type SrcKey = u64;

/// Operations recorded by the sampling layout.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[allow(missing_docs)]
pub enum ArrayOp {
    Escalate,
    Release,
    IsVectorData,
    GetInt,
    GetStr,
    GetPosKey,
    GetPosVal,
    GetIntPos,
    GetStrPos,
    IterBegin,
    IterLast,
    IterEnd,
    IterAdvance,
    IterRewind,
    LvalInt,
    LvalStr,
    ElemInt,
    ElemStr,
    SetInt,
    SetStr,
    RemoveInt,
    RemoveStr,
    Append,
    Pop,
    PreSort,
    PostSort,
    ToDvArray,
    ToHackArr,
    SetLegacyArray,
    ConvertToUncounted,
    ReleaseUncounted,
}

/// One recorded operation, keyed by the types involved.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LoggingEvent {
    /// The operation
    pub op: ArrayOp,
    /// Type of the key argument, if any
    pub key: Option<DataType>,
    /// Type of the value argument, if any
    pub value: Option<DataType>,
}

/// Event counts for the arrays created at one source location.
#[derive(Debug)]
pub struct LoggingProfile {
    source: String,
    events: DashMap<LoggingEvent, u64>,
    reach_events: DashMap<(TransId, SrcKey), u64>,
}

impl LoggingProfile {
    /// Creates an empty profile for arrays created at `source`.
    pub fn new(source: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            source: source.into(),
            events: DashMap::new(),
            reach_events: DashMap::new(),
        })
    }

    /// Where the profiled arrays come from.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Counts one event.
    pub fn log_event(&self, event: LoggingEvent) {
        *self.events.entry(event).or_insert(0) += 1;
    }

    /// Total count of `op`, over all key and value types.
    pub fn event_count(&self, op: ArrayOp) -> u64 {
        self.events
            .iter()
            .filter(|entry| entry.key().op == op)
            .map(|entry| *entry.value())
            .sum()
    }

    /// Snapshot of all counts, sorted by event.
    pub fn events(&self) -> Vec<(LoggingEvent, u64)> {
        let mut events: Vec<_> = self
            .events
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect();
        events.sort_unstable();
        events
    }

    /// Counts a translation reaching a source location.
    pub fn log_reach(&self, trans_id: TransId, src_key: SrcKey) {
        *self.reach_events.entry((trans_id, src_key)).or_insert(0) += 1;
    }

    /// Number of times `trans_id` reached `src_key`.
    pub fn reach_count(&self, trans_id: TransId, src_key: SrcKey) -> u64 {
        self.reach_events
            .get(&(trans_id, src_key))
            .map_or(0, |count| *count)
    }
}

/// Decides which new arrays get wrapped: one in every `rate`.
#[derive(Debug)]
pub struct Sampler {
    rate: u32,
    counter: AtomicU64,
}

impl Sampler {
    /// A rate of zero never samples.
    pub fn new(rate: u32) -> Self {
        Self {
            rate,
            counter: AtomicU64::new(0),
        }
    }

    /// Sampler configured by `logging_sample_rate`.
    pub fn from_options(options: &RuntimeOptions) -> Self {
        Self::new(options.logging_sample_rate)
    }

    /// Returns true for every `rate`-th call, starting with the first.
    pub fn should_sample(&self) -> bool {
        self.rate != 0 && self.counter.fetch_add(1, Ordering::Relaxed) % u64::from(self.rate) == 0
    }
}

/// Bespoke wrapper recording operations on a vanilla array.
#[repr(C)]
pub struct LoggingArray {
    header: ArrayData,
    wrapped: Array,
    profile: Arc<LoggingProfile>,
}

impl LoggingArray {
    /// Index reserved for this layout.
    pub const LAYOUT_INDEX: LayoutIndex = LayoutIndex::from_slot(0);

    /// Operation table of this layout.
    pub const FUNCTIONS: LayoutFunctions = LayoutFunctions {
        heap_size: Self::heap_size,
        release: Self::release,
        is_vector_data: Self::is_vector_data,
        get_int: Self::get_int,
        get_str: Self::get_str,
        get_pos_key: Self::get_pos_key,
        get_pos_val: Self::get_pos_val,
        get_int_pos: Self::get_int_pos,
        get_str_pos: Self::get_str_pos,
        iter_begin: Self::iter_begin,
        iter_last: Self::iter_last,
        iter_end: Self::iter_end,
        iter_advance: Self::iter_advance,
        iter_rewind: Self::iter_rewind,
        lval_int: Self::lval_int,
        lval_str: Self::lval_str,
        elem_int: Self::elem_int,
        elem_str: Self::elem_str,
        set_int: Self::set_int,
        set_str: Self::set_str,
        set_int_move: Self::set_int_move,
        set_str_move: Self::set_str_move,
        remove_int: Self::remove_int,
        remove_str: Self::remove_str,
        pre_sort: Self::pre_sort,
        post_sort: Self::post_sort,
        append: Self::append,
        pop: Self::pop,
        to_dv_array: Self::to_dv_array,
        to_hack_arr: Self::to_hack_arr,
        set_legacy_array: Self::set_legacy_array,
        escalate_to_vanilla: Self::escalate_to_vanilla,
        convert_to_uncounted: Self::convert_to_uncounted,
        release_uncounted: Self::release_uncounted,
    };

    /// Wraps a vanilla array. Anything but a uniquely owned counted array is
    /// copied first so the wrapper owns its contents exclusively.
    pub fn make(array: Array, profile: Arc<LoggingProfile>) -> Array {
        // Safety: freshly created wrapper with one reference
        unsafe { Array::from_raw(Self::make_raw(array, profile)) }
    }

    /// Wraps `array` if it is a counted vanilla array and the sampler picks it.
    pub fn maybe_make(array: Array, sampler: &Sampler, profile: &Arc<LoggingProfile>) -> Array {
        if array.is_vanilla() && array.header().is_ref_counted() && sampler.should_sample() {
            Self::make(array, profile.clone())
        } else {
            array
        }
    }

    fn make_raw(array: Array, profile: Arc<LoggingProfile>) -> NonNull<ArrayData> {
        always_assert!(
            array.is_vanilla(),
            "LoggingArray can only wrap vanilla arrays, got {:?}",
            array.header()
        );
        let wrapped = if array.is_unique() {
            array
        } else {
            // Safety: the copy carries exactly one reference
            unsafe { Array::from_raw(VanillaArray::copy(array.header())) }
        };
        let header = BespokeArray::header(
            ArrayKind::bespoke(wrapped.array_type()),
            Self::LAYOUT_INDEX,
        );
        let mut la = Box::new(LoggingArray {
            header,
            wrapped,
            profile,
        });
        la.sync_header();
        tracing::trace!(target: "bespoke::logging", source = la.profile.source(), "sampled array");
        NonNull::from(Box::leak(la)).cast()
    }

    /// Reinterprets a bespoke header of this layout.
    pub fn as_logging(ad: &ArrayData) -> &LoggingArray {
        debug_assert_eq!(BespokeArray::as_bespoke(ad).layout_index(), Self::LAYOUT_INDEX);
        // Safety: headers with this layout index are always `LoggingArray`s
        unsafe { &*(ad as *const ArrayData).cast::<LoggingArray>() }
    }

    // Safety: `ad` must be a live `LoggingArray` not aliased elsewhere for `'a`
    unsafe fn as_mut<'a>(ad: NonNull<ArrayData>) -> &'a mut LoggingArray {
        &mut *ad.cast::<LoggingArray>().as_ptr()
    }

    /// The vanilla array being profiled.
    pub fn wrapped(&self) -> &Array {
        &self.wrapped
    }

    /// The profile receiving this array's events.
    pub fn profile(&self) -> &Arc<LoggingProfile> {
        &self.profile
    }

    /// Records a reach event in the profile.
    pub fn log_reach_event(&self, trans_id: TransId, src_key: SrcKey) {
        self.profile.log_reach(trans_id, src_key);
    }

    fn log(ad: &ArrayData, op: ArrayOp, key: Option<DataType>, value: Option<DataType>) {
        let la = Self::as_logging(ad);
        tracing::trace!(target: "bespoke::logging", source = la.profile.source(), ?op, ?key, ?value);
        la.profile.log_event(LoggingEvent { op, key, value });
    }

    /// Mirrors the wrapped array's category, size and legacy mark.
    fn sync_header(&mut self) {
        let hd = self.wrapped.header();
        let kind = ArrayKind::bespoke(hd.array_type());
        let size = hd.size();
        let legacy = hd.is_legacy_array();
        self.header.set_kind(kind);
        self.header.set_size(size);
        self.header.set_legacy_flag(legacy);
        if self.wrapped.is_unique() {
            // Safety: the wrapped array is owned by us alone
            unsafe { (*self.wrapped.as_ptr().as_ptr()).set_sampled_array(true) };
        }
    }

    /// Applies `f` to the wrapped array. A uniquely owned wrapper is updated
    /// in place unless `force_copy` is set; otherwise a new wrapper is
    /// created, unless `f` left the wrapped array untouched.
    // Safety: `ad` must be a live `LoggingArray` the caller holds a reference to
    unsafe fn mutate(
        ad: NonNull<ArrayData>,
        force_copy: bool,
        f: impl FnOnce(Array) -> Array,
    ) -> NonNull<ArrayData> {
        if !force_copy && ad.as_ref().has_exactly_one_ref() {
            let la = Self::as_mut(ad);
            let wrapped = ptr::read(&la.wrapped);
            ptr::write(&mut la.wrapped, f(wrapped));
            la.sync_header();
            return ad;
        }
        let la = Self::as_logging(ad.as_ref());
        let result = f(la.wrapped.clone());
        if result.ptr_eq(&la.wrapped) {
            return ad;
        }
        Self::make_raw(result, la.profile.clone())
    }

    // Safety: as for `mutate`; the caller's reference is consumed
    unsafe fn mutate_move(ad: NonNull<ArrayData>, f: impl FnOnce(Array) -> Array) -> NonNull<ArrayData> {
        let result = Self::mutate(ad, false, f);
        if result != ad {
            release_ref(ad);
        }
        result
    }

    /// Makes the wrapper behind `array` and its wrapped array uniquely owned.
    fn unique_mut(array: &mut Array) -> &mut LoggingArray {
        if !array.is_unique() {
            let la = Self::as_logging(array.header());
            let copy = Self::make_raw(la.wrapped.clone(), la.profile.clone());
            // Safety: fresh wrapper with one reference
            *array = unsafe { Array::from_raw(copy) };
        }
        // Safety: uniquely owned, borrowed for the lifetime of `array`
        let la = unsafe { Self::as_mut(array.as_ptr()) };
        if !la.wrapped.is_unique() {
            // Safety: the copy carries exactly one reference
            la.wrapped = unsafe { Array::from_raw(VanillaArray::copy(la.wrapped.header())) };
            la.sync_header();
        }
        la
    }

    fn heap_size(_ad: &ArrayData) -> usize {
        mem::size_of::<LoggingArray>()
    }

    unsafe fn release(ad: NonNull<ArrayData>) {
        Self::log(ad.as_ref(), ArrayOp::Release, None, None);
        drop(Box::from_raw(ad.cast::<LoggingArray>().as_ptr()));
    }

    fn is_vector_data(ad: &ArrayData) -> bool {
        Self::log(ad, ArrayOp::IsVectorData, None, None);
        Self::as_logging(ad).wrapped.is_vector_data()
    }

    fn get_int(ad: &ArrayData, key: i64) -> TypedValue {
        Self::log(ad, ArrayOp::GetInt, Some(DataType::Int), None);
        Self::as_logging(ad).wrapped.get_int(key)
    }

    fn get_str(ad: &ArrayData, key: &str) -> TypedValue {
        Self::log(ad, ArrayOp::GetStr, Some(DataType::Str), None);
        Self::as_logging(ad).wrapped.get_str(key)
    }

    fn get_pos_key(ad: &ArrayData, pos: Pos) -> TypedValue {
        Self::log(ad, ArrayOp::GetPosKey, None, None);
        Self::as_logging(ad).wrapped.get_pos_key(pos)
    }

    fn get_pos_val(ad: &ArrayData, pos: Pos) -> TypedValue {
        Self::log(ad, ArrayOp::GetPosVal, None, None);
        Self::as_logging(ad).wrapped.get_pos_val(pos)
    }

    fn get_int_pos(ad: &ArrayData, key: i64) -> Pos {
        Self::log(ad, ArrayOp::GetIntPos, Some(DataType::Int), None);
        Self::as_logging(ad).wrapped.get_int_pos(key)
    }

    fn get_str_pos(ad: &ArrayData, key: &str) -> Pos {
        Self::log(ad, ArrayOp::GetStrPos, Some(DataType::Str), None);
        Self::as_logging(ad).wrapped.get_str_pos(key)
    }

    fn iter_begin(ad: &ArrayData) -> Pos {
        Self::log(ad, ArrayOp::IterBegin, None, None);
        Self::as_logging(ad).wrapped.iter_begin()
    }

    fn iter_last(ad: &ArrayData) -> Pos {
        Self::log(ad, ArrayOp::IterLast, None, None);
        Self::as_logging(ad).wrapped.iter_last()
    }

    fn iter_end(ad: &ArrayData) -> Pos {
        Self::log(ad, ArrayOp::IterEnd, None, None);
        Self::as_logging(ad).wrapped.iter_end()
    }

    fn iter_advance(ad: &ArrayData, pos: Pos) -> Pos {
        Self::log(ad, ArrayOp::IterAdvance, None, None);
        Self::as_logging(ad).wrapped.iter_advance(pos)
    }

    fn iter_rewind(ad: &ArrayData, pos: Pos) -> Pos {
        Self::log(ad, ArrayOp::IterRewind, None, None);
        Self::as_logging(ad).wrapped.iter_rewind(pos)
    }

    fn lval_int(array: &mut Array, key: i64) -> &mut TypedValue {
        Self::log(array.header(), ArrayOp::LvalInt, Some(DataType::Int), None);
        let la = Self::unique_mut(array);
        if !la.wrapped.exists_int(key) {
            // Safety: `wrapped` is read out and written back before any other use
            unsafe {
                let wrapped = ptr::read(&la.wrapped);
                ptr::write(&mut la.wrapped, wrapped.set_int(key, TypedValue::Null));
            }
            la.sync_header();
        }
        la.wrapped.lval_int(key)
    }

    fn lval_str<'a>(array: &'a mut Array, key: &str) -> &'a mut TypedValue {
        Self::log(array.header(), ArrayOp::LvalStr, Some(DataType::Str), None);
        let la = Self::unique_mut(array);
        if !la.wrapped.exists_str(key) {
            // Safety: `wrapped` is read out and written back before any other use
            unsafe {
                let wrapped = ptr::read(&la.wrapped);
                ptr::write(&mut la.wrapped, wrapped.set_str(key, TypedValue::Null));
            }
            la.sync_header();
        }
        la.wrapped.lval_str(key)
    }

    fn elem_int(
        array: &mut Array,
        key: i64,
        throw_on_missing: bool,
    ) -> Result<Option<&mut TypedValue>, BespokeError> {
        Self::log(array.header(), ArrayOp::ElemInt, Some(DataType::Int), None);
        if !Self::as_logging(array.header()).wrapped.exists_int(key) {
            return BespokeError::missing(throw_on_missing, key);
        }
        Self::unique_mut(array).wrapped.elem_int(key, throw_on_missing)
    }

    fn elem_str<'a>(
        array: &'a mut Array,
        key: &str,
        throw_on_missing: bool,
    ) -> Result<Option<&'a mut TypedValue>, BespokeError> {
        Self::log(array.header(), ArrayOp::ElemStr, Some(DataType::Str), None);
        if !Self::as_logging(array.header()).wrapped.exists_str(key) {
            return BespokeError::missing(throw_on_missing, format_args!("\"{}\"", key));
        }
        Self::unique_mut(array).wrapped.elem_str(key, throw_on_missing)
    }

    unsafe fn set_int(ad: NonNull<ArrayData>, key: i64, value: &TypedValue) -> NonNull<ArrayData> {
        Self::log(ad.as_ref(), ArrayOp::SetInt, Some(DataType::Int), Some(value.data_type()));
        Self::mutate(ad, false, |w| w.set_int(key, value.clone()))
    }

    unsafe fn set_str(ad: NonNull<ArrayData>, key: &str, value: &TypedValue) -> NonNull<ArrayData> {
        Self::log(ad.as_ref(), ArrayOp::SetStr, Some(DataType::Str), Some(value.data_type()));
        Self::mutate(ad, false, |w| w.set_str(key, value.clone()))
    }

    unsafe fn set_int_move(ad: NonNull<ArrayData>, key: i64, value: TypedValue) -> NonNull<ArrayData> {
        Self::log(ad.as_ref(), ArrayOp::SetInt, Some(DataType::Int), Some(value.data_type()));
        Self::mutate_move(ad, move |w| w.set_int(key, value))
    }

    unsafe fn set_str_move(ad: NonNull<ArrayData>, key: &str, value: TypedValue) -> NonNull<ArrayData> {
        Self::log(ad.as_ref(), ArrayOp::SetStr, Some(DataType::Str), Some(value.data_type()));
        Self::mutate_move(ad, move |w| w.set_str(key, value))
    }

    unsafe fn remove_int(ad: NonNull<ArrayData>, key: i64) -> NonNull<ArrayData> {
        Self::log(ad.as_ref(), ArrayOp::RemoveInt, Some(DataType::Int), None);
        Self::mutate(ad, false, |w| w.remove_int(key))
    }

    unsafe fn remove_str(ad: NonNull<ArrayData>, key: &str) -> NonNull<ArrayData> {
        Self::log(ad.as_ref(), ArrayOp::RemoveStr, Some(DataType::Str), None);
        Self::mutate(ad, false, |w| w.remove_str(key))
    }

    unsafe fn append(ad: NonNull<ArrayData>, value: &TypedValue) -> NonNull<ArrayData> {
        Self::log(ad.as_ref(), ArrayOp::Append, None, Some(value.data_type()));
        Self::mutate(ad, false, |w| w.append(value.clone()))
    }

    unsafe fn pop(ad: NonNull<ArrayData>, out: &mut TypedValue) -> NonNull<ArrayData> {
        Self::log(ad.as_ref(), ArrayOp::Pop, None, None);
        Self::mutate(ad, false, |w| {
            let (w, value) = w.pop();
            *out = value;
            w
        })
    }

    unsafe fn pre_sort(ad: NonNull<ArrayData>, sf: SortFunction) -> NonNull<ArrayData> {
        let la = Self::as_logging(ad.as_ref());
        tracing::trace!(target: "bespoke::logging", source = la.profile.source(), sort = ?sf, "pre_sort");
        Self::log(ad.as_ref(), ArrayOp::PreSort, None, None);
        VanillaArray::copy(la.wrapped.header())
    }

    unsafe fn post_sort(ad: NonNull<ArrayData>, vad: NonNull<ArrayData>) -> NonNull<ArrayData> {
        Self::log(ad.as_ref(), ArrayOp::PostSort, None, None);
        let sorted = Array::from_raw(vad);
        Self::mutate(ad, false, move |_| sorted)
    }

    unsafe fn to_dv_array(ad: NonNull<ArrayData>, copy: bool) -> NonNull<ArrayData> {
        Self::log(ad.as_ref(), ArrayOp::ToDvArray, None, None);
        Self::mutate(ad, copy, Array::to_dv_array)
    }

    unsafe fn to_hack_arr(ad: NonNull<ArrayData>, copy: bool) -> NonNull<ArrayData> {
        Self::log(ad.as_ref(), ArrayOp::ToHackArr, None, None);
        Self::mutate(ad, copy, Array::to_hack_arr)
    }

    unsafe fn set_legacy_array(ad: NonNull<ArrayData>, copy: bool, legacy: bool) -> NonNull<ArrayData> {
        Self::log(ad.as_ref(), ArrayOp::SetLegacyArray, None, None);
        Self::mutate(ad, copy, |w| w.set_legacy_array(legacy))
    }

    fn escalate_to_vanilla(ad: &ArrayData, reason: &'static str) -> NonNull<ArrayData> {
        Self::log(ad, ArrayOp::Escalate, None, None);
        let la = Self::as_logging(ad);
        tracing::debug!(target: "bespoke::logging", source = la.profile.source(), reason, "escalating");
        VanillaArray::copy(la.wrapped.header())
    }

    unsafe fn convert_to_uncounted(
        ad: NonNull<ArrayData>,
        heap: &UncountedHeap<'_>,
        seen: Option<&mut dyn DedupMap>,
    ) {
        Self::log(ad.as_ref(), ArrayOp::ConvertToUncounted, None, None);
        let la = Self::as_mut(ad);
        // The byte copy shares the counted array and the profile without
        // owning either.
        let counted = la.wrapped.as_ptr();
        let converted = make_uncounted_array(counted, false, heap, seen);
        ptr::write(&mut la.wrapped, Array::from_raw(converted));
        mem::forget(Arc::clone(&la.profile));
    }

    unsafe fn release_uncounted(ad: NonNull<ArrayData>, heap: &UncountedHeap<'_>) {
        Self::log(ad.as_ref(), ArrayOp::ReleaseUncounted, None, None);
        let la = Self::as_mut(ad);
        let wrapped = ptr::read(&la.wrapped);
        release_uncounted_array(wrapped.into_raw(), heap);
        ptr::drop_in_place(&mut la.profile);
    }
}
