//! A small bespoke layout for tests: up to eight integers stored inline.
//!
//! Anything it cannot represent (non-integer values, string keys, gaps,
//! middle removals, overflow, element slots) escalates to a vanilla array.

use std::mem;
use std::ptr::NonNull;
use std::sync::OnceLock;

use bespoke_array::{
    Array, ArrayData, ArrayKind, ArrayType, BespokeArray, BespokeError, DedupMap, LayoutFunctions,
    LayoutIndex, LayoutRegistry, Pos, RefCountMode, SortFunction, TypedValue, UncountedHeap,
    VanillaArray,
};

pub const CAPACITY: usize = 8;

static INDEX: OnceLock<LayoutIndex> = OnceLock::new();

#[repr(C)]
pub struct IntVec {
    header: ArrayData,
    values: [i64; CAPACITY],
}

pub fn register(registry: &mut LayoutRegistry) {
    let index = registry
        .register("IntVec", &FUNCTIONS)
        .expect("registry has room");
    INDEX.set(index).expect("IntVec registered twice");
}

pub fn index() -> LayoutIndex {
    *INDEX.get().expect("IntVec is not registered")
}

/// A counted bespoke vec holding `values`.
pub fn make(values: &[i64]) -> Array {
    assert!(values.len() <= CAPACITY);
    let mut array = IntVec {
        header: BespokeArray::header(ArrayKind::BespokeVec, index()),
        values: [0; CAPACITY],
    };
    array.values[..values.len()].copy_from_slice(values);
    array.header.set_size(values.len());
    unsafe { Array::from_raw(into_raw(array)) }
}

pub fn is_int_vec(array: &Array) -> bool {
    array.is_bespoke() && BespokeArray::as_bespoke(array.header()).layout_index() == index()
}

fn into_raw(array: IntVec) -> NonNull<ArrayData> {
    NonNull::from(Box::leak(Box::new(array))).cast()
}

fn as_int_vec(ad: &ArrayData) -> &IntVec {
    unsafe { &*(ad as *const ArrayData).cast::<IntVec>() }
}

unsafe fn as_mut<'a>(ad: NonNull<ArrayData>) -> &'a mut IntVec {
    &mut *ad.cast::<IntVec>().as_ptr()
}

impl IntVec {
    fn len(&self) -> usize {
        self.header.size()
    }

    fn values(&self) -> &[i64] {
        &self.values[..self.len()]
    }

    fn index_of(&self, key: i64) -> Option<usize> {
        usize::try_from(key).ok().filter(|&k| k < self.len())
    }
}

fn copy(ad: &ArrayData) -> NonNull<ArrayData> {
    let src = as_int_vec(ad);
    let mut header = BespokeArray::header(ad.kind(), index());
    header.set_size(src.len());
    header.set_legacy_flag(ad.is_legacy_array());
    into_raw(IntVec {
        header,
        values: src.values,
    })
}

unsafe fn cow(ad: NonNull<ArrayData>) -> NonNull<ArrayData> {
    if ad.as_ref().has_exactly_one_ref() {
        ad
    } else {
        copy(ad.as_ref())
    }
}

fn escalate(ad: &ArrayData) -> NonNull<ArrayData> {
    escalate_to_vanilla(ad, "IntVec")
}

fn heap_size(_ad: &ArrayData) -> usize {
    mem::size_of::<IntVec>()
}

unsafe fn release(ad: NonNull<ArrayData>) {
    drop(Box::from_raw(ad.cast::<IntVec>().as_ptr()));
}

fn is_vector_data(_ad: &ArrayData) -> bool {
    true
}

fn get_int(ad: &ArrayData, key: i64) -> TypedValue {
    let iv = as_int_vec(ad);
    iv.index_of(key)
        .map_or(TypedValue::Uninit, |k| TypedValue::Int(iv.values[k]))
}

fn get_str(_ad: &ArrayData, _key: &str) -> TypedValue {
    TypedValue::Uninit
}

fn get_pos_key(_ad: &ArrayData, pos: Pos) -> TypedValue {
    TypedValue::Int(pos as i64)
}

fn get_pos_val(ad: &ArrayData, pos: Pos) -> TypedValue {
    TypedValue::Int(as_int_vec(ad).values()[pos])
}

fn get_int_pos(ad: &ArrayData, key: i64) -> Pos {
    let iv = as_int_vec(ad);
    iv.index_of(key).unwrap_or(iv.len())
}

fn get_str_pos(ad: &ArrayData, _key: &str) -> Pos {
    ad.size()
}

fn iter_begin(_ad: &ArrayData) -> Pos {
    0
}

fn iter_last(ad: &ArrayData) -> Pos {
    if ad.is_empty() {
        ad.size()
    } else {
        ad.size() - 1
    }
}

fn iter_end(ad: &ArrayData) -> Pos {
    ad.size()
}

fn iter_advance(ad: &ArrayData, pos: Pos) -> Pos {
    (pos + 1).min(ad.size())
}

fn iter_rewind(ad: &ArrayData, pos: Pos) -> Pos {
    if pos == 0 || pos > ad.size() {
        ad.size()
    } else {
        pos - 1
    }
}

fn escalate_in_handle(array: &mut Array) {
    *array = unsafe { Array::from_raw(escalate(array.header())) };
}

fn lval_int(array: &mut Array, key: i64) -> &mut TypedValue {
    escalate_in_handle(array);
    VanillaArray::lval_int(array, key)
}

fn lval_str<'a>(array: &'a mut Array, key: &str) -> &'a mut TypedValue {
    escalate_in_handle(array);
    VanillaArray::lval_str(array, key)
}

fn elem_int(
    array: &mut Array,
    key: i64,
    throw_on_missing: bool,
) -> Result<Option<&mut TypedValue>, BespokeError> {
    if !get_int(array.header(), key).is_init() {
        return BespokeError::missing(throw_on_missing, key);
    }
    escalate_in_handle(array);
    VanillaArray::elem_int(array, key, throw_on_missing)
}

fn elem_str<'a>(
    _array: &'a mut Array,
    key: &str,
    throw_on_missing: bool,
) -> Result<Option<&'a mut TypedValue>, BespokeError> {
    BespokeError::missing(throw_on_missing, format_args!("\"{}\"", key))
}

unsafe fn set_int(ad: NonNull<ArrayData>, key: i64, value: &TypedValue) -> NonNull<ArrayData> {
    let iv = as_int_vec(ad.as_ref());
    let len = iv.len();
    match (value.as_int(), iv.index_of(key)) {
        (Some(v), Some(k)) => {
            let result = cow(ad);
            as_mut(result).values[k] = v;
            result
        }
        (Some(v), None) if key == len as i64 && len < CAPACITY => {
            let result = cow(ad);
            let iv = as_mut(result);
            iv.values[len] = v;
            iv.header.set_size(len + 1);
            result
        }
        _ => VanillaArray::set_int_move(escalate(ad.as_ref()), key, value.clone()),
    }
}

unsafe fn set_str(ad: NonNull<ArrayData>, key: &str, value: &TypedValue) -> NonNull<ArrayData> {
    VanillaArray::set_str_move(escalate(ad.as_ref()), key, value.clone())
}

unsafe fn set_int_move(ad: NonNull<ArrayData>, key: i64, value: TypedValue) -> NonNull<ArrayData> {
    let result = set_int(ad, key, &value);
    if result != ad {
        drop(Array::from_raw(ad));
    }
    result
}

unsafe fn set_str_move(ad: NonNull<ArrayData>, key: &str, value: TypedValue) -> NonNull<ArrayData> {
    let result = set_str(ad, key, &value);
    if result != ad {
        drop(Array::from_raw(ad));
    }
    result
}

unsafe fn remove_int(ad: NonNull<ArrayData>, key: i64) -> NonNull<ArrayData> {
    let iv = as_int_vec(ad.as_ref());
    match iv.index_of(key) {
        None => ad,
        Some(k) if k + 1 == iv.len() => {
            let result = cow(ad);
            as_mut(result).header.set_size(k);
            result
        }
        Some(_) => VanillaArray::remove_int(escalate(ad.as_ref()), key),
    }
}

unsafe fn remove_str(ad: NonNull<ArrayData>, _key: &str) -> NonNull<ArrayData> {
    ad
}

unsafe fn append(ad: NonNull<ArrayData>, value: &TypedValue) -> NonNull<ArrayData> {
    let len = ad.as_ref().size();
    match value.as_int() {
        Some(v) if len < CAPACITY => {
            let result = cow(ad);
            let iv = as_mut(result);
            iv.values[len] = v;
            iv.header.set_size(len + 1);
            result
        }
        _ => VanillaArray::append(escalate(ad.as_ref()), value),
    }
}

unsafe fn pop(ad: NonNull<ArrayData>, out: &mut TypedValue) -> NonNull<ArrayData> {
    let len = ad.as_ref().size();
    if len == 0 {
        *out = TypedValue::Null;
        return ad;
    }
    let result = cow(ad);
    let iv = as_mut(result);
    *out = TypedValue::Int(iv.values[len - 1]);
    iv.header.set_size(len - 1);
    result
}

unsafe fn pre_sort(ad: NonNull<ArrayData>, _sf: SortFunction) -> NonNull<ArrayData> {
    escalate(ad.as_ref())
}

unsafe fn post_sort(ad: NonNull<ArrayData>, vad: NonNull<ArrayData>) -> NonNull<ArrayData> {
    let sorted = Array::from_raw(vad);
    let result = cow(ad);
    let iv = as_mut(result);
    for (slot, (_, value)) in iv.values.iter_mut().zip(sorted.iter()) {
        *slot = value.as_int().expect("IntVec snapshots hold integers");
    }
    result
}

unsafe fn convert(ad: NonNull<ArrayData>, copy_first: bool, kind: ArrayKind) -> NonNull<ArrayData> {
    if ad.as_ref().kind() == kind {
        return ad;
    }
    let result = if copy_first { copy(ad.as_ref()) } else { ad };
    let hd = &mut *result.as_ptr();
    let aux = hd.aux16() & !ArrayData::LEGACY_ARRAY;
    hd.init_header_16(kind, RefCountMode::Counted, aux);
    result
}

unsafe fn to_dv_array(ad: NonNull<ArrayData>, copy_first: bool) -> NonNull<ArrayData> {
    convert(ad, copy_first, ArrayKind::BespokeVArray)
}

unsafe fn to_hack_arr(ad: NonNull<ArrayData>, copy_first: bool) -> NonNull<ArrayData> {
    convert(ad, copy_first, ArrayKind::BespokeVec)
}

unsafe fn set_legacy_array(ad: NonNull<ArrayData>, copy_first: bool, legacy: bool) -> NonNull<ArrayData> {
    assert_eq!(ad.as_ref().array_type(), ArrayType::Vec);
    if ad.as_ref().is_legacy_array() == legacy {
        return ad;
    }
    let result = if copy_first { copy(ad.as_ref()) } else { ad };
    (*result.as_ptr()).set_legacy_flag(legacy);
    result
}

fn escalate_to_vanilla(ad: &ArrayData, _reason: &'static str) -> NonNull<ArrayData> {
    let iv = as_int_vec(ad);
    let array = VanillaArray::from_values(
        ArrayKind::vanilla(ad.array_type()),
        iv.values().iter().map(|&v| TypedValue::Int(v)),
    );
    let array = if ad.is_legacy_array() {
        array.set_legacy_array(true)
    } else {
        array
    };
    array.into_raw()
}

unsafe fn convert_to_uncounted(
    _ad: NonNull<ArrayData>,
    _heap: &UncountedHeap<'_>,
    _seen: Option<&mut dyn DedupMap>,
) {
}

unsafe fn release_uncounted(_ad: NonNull<ArrayData>, _heap: &UncountedHeap<'_>) {}

pub static FUNCTIONS: LayoutFunctions = LayoutFunctions {
    heap_size,
    release,
    is_vector_data,
    get_int,
    get_str,
    get_pos_key,
    get_pos_val,
    get_int_pos,
    get_str_pos,
    iter_begin,
    iter_last,
    iter_end,
    iter_advance,
    iter_rewind,
    lval_int,
    lval_str,
    elem_int,
    elem_str,
    set_int,
    set_str,
    set_int_move,
    set_str_move,
    remove_int,
    remove_str,
    pre_sort,
    post_sort,
    append,
    pop,
    to_dv_array,
    to_hack_arr,
    set_legacy_array,
    escalate_to_vanilla,
    convert_to_uncounted,
    release_uncounted,
};
