//! The canonical array representation
//!
//! Every bespoke layout can escalate to this representation, and the generic
//! sort routine only operates on it.

use std::cmp::Ordering;
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::Arc;

use hashbrown::HashMap;

use crate::array::{release_ref, Array};
use crate::error::BespokeError;
use crate::header::{ArrayData, ArrayKind, RefCountMode};
use crate::layout::Pos;
use crate::sort::{Comparator, SortFunction};
use crate::uncounted::{
    reborrow, release_uncounted_value, reuse_seen, to_uncounted_value, uncounted_alloc_extra,
    DedupMap, UncountedHeap,
};
use crate::value::{Key, TypedValue};

/// Insertion-ordered array with integer and string key indexes.
///
/// Packed kinds (varray, vec) keep their keys equal to their positions; any
/// operation that would break this turns them into the matching mixed kind.
#[repr(C)]
pub struct VanillaArray {
    header: ArrayData,
    entries: Vec<(Key, TypedValue)>,
    int_index: HashMap<i64, usize>,
    str_index: HashMap<Arc<str>, usize>,
    next_ki: i64,
}

impl VanillaArray {
    fn empty(kind: ArrayKind, mode: RefCountMode, aux16: u16) -> Self {
        debug_assert!(kind.is_vanilla());
        Self {
            header: ArrayData::new(kind, mode, aux16),
            entries: Vec::new(),
            int_index: HashMap::new(),
            str_index: HashMap::new(),
            next_ki: 0,
        }
    }

    fn into_raw(self) -> NonNull<ArrayData> {
        NonNull::from(Box::leak(Box::new(self))).cast()
    }

    /// Creates an empty counted array of a vanilla kind.
    pub fn make(kind: ArrayKind) -> Array {
        let raw = Self::empty(kind, RefCountMode::Counted, 0).into_raw();
        // Safety: freshly allocated with one reference
        unsafe { Array::from_raw(raw) }
    }

    /// Creates a counted array from key/value pairs, in order.
    pub fn from_entries<I>(kind: ArrayKind, entries: I) -> Array
    where
        I: IntoIterator<Item = (Key, TypedValue)>,
    {
        let mut array = Self::empty(kind, RefCountMode::Counted, 0);
        for (key, value) in entries {
            array.insert(key, value);
        }
        // Safety: freshly allocated with one reference
        unsafe { Array::from_raw(array.into_raw()) }
    }

    /// Creates a counted array by appending values, in order.
    pub fn from_values<I>(kind: ArrayKind, values: I) -> Array
    where
        I: IntoIterator<Item = TypedValue>,
    {
        let mut array = Self::empty(kind, RefCountMode::Counted, 0);
        for value in values {
            array.append_value(value);
        }
        // Safety: freshly allocated with one reference
        unsafe { Array::from_raw(array.into_raw()) }
    }

    pub(crate) fn as_vanilla(ad: &ArrayData) -> &VanillaArray {
        debug_assert!(ad.is_vanilla());
        // Safety: vanilla kinds are only ever written into `VanillaArray` headers
        unsafe { &*(ad as *const ArrayData).cast::<VanillaArray>() }
    }

    // Safety: `ad` must be a live vanilla array not aliased elsewhere for `'a`
    unsafe fn as_mut<'a>(ad: NonNull<ArrayData>) -> &'a mut VanillaArray {
        debug_assert!(ad.as_ref().is_vanilla());
        &mut *ad.cast::<VanillaArray>().as_ptr()
    }

    fn kind(&self) -> ArrayKind {
        self.header.kind()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn position_of_int(&self, key: i64) -> Option<usize> {
        self.int_index.get(&key).copied()
    }

    fn position_of_str(&self, key: &str) -> Option<usize> {
        self.str_index.get(key).copied()
    }

    fn position_of(&self, key: &Key) -> Option<usize> {
        match key {
            Key::Int(k) => self.position_of_int(*k),
            Key::Str(s) => self.position_of_str(s),
        }
    }

    fn to_mixed_in_place(&mut self) {
        match self.kind() {
            ArrayKind::Packed => self.header.set_kind(ArrayKind::Mixed),
            ArrayKind::Vec => self.header.set_kind(ArrayKind::Dict),
            _ => {}
        }
    }

    fn push_entry(&mut self, key: Key, value: TypedValue) -> usize {
        let pos = self.entries.len();
        match &key {
            Key::Int(k) => {
                self.int_index.insert(*k, pos);
                if *k >= self.next_ki {
                    self.next_ki = k.saturating_add(1);
                }
            }
            Key::Str(s) => {
                self.str_index.insert(s.clone(), pos);
            }
        }
        self.entries.push((key, value));
        self.header.set_size(self.entries.len());
        pos
    }

    /// Inserts or overwrites, returning the position of the slot.
    fn insert(&mut self, key: Key, value: TypedValue) -> usize {
        debug_assert!(value.is_init());
        if self.header.is_packed_shape() {
            if let Key::Int(k) = key {
                let len = self.len() as i64;
                if (0..len).contains(&k) {
                    self.entries[k as usize].1 = value;
                    return k as usize;
                }
                if k == len {
                    return self.push_entry(key, value);
                }
            }
            self.to_mixed_in_place();
        }
        match self.position_of(&key) {
            Some(pos) => {
                self.entries[pos].1 = value;
                pos
            }
            None => self.push_entry(key, value),
        }
    }

    fn append_value(&mut self, value: TypedValue) {
        let key = if self.kind() == ArrayKind::Keyset {
            Key::from_value(&value).unwrap_or(Key::Int(self.next_ki))
        } else {
            Key::Int(self.next_ki)
        };
        self.insert(key, value);
    }

    fn reindex(&mut self) {
        self.int_index.clear();
        self.str_index.clear();
        for (pos, (key, _)) in self.entries.iter().enumerate() {
            match key {
                Key::Int(k) => {
                    self.int_index.insert(*k, pos);
                }
                Key::Str(s) => {
                    self.str_index.insert(s.clone(), pos);
                }
            }
        }
        self.header.set_size(self.entries.len());
    }

    fn remove_at(&mut self, pos: usize) -> TypedValue {
        if self.header.is_packed_shape() && pos + 1 != self.len() {
            self.to_mixed_in_place();
        }
        let (key, value) = self.entries.remove(pos);
        match key {
            Key::Int(k) => {
                self.int_index.remove(&k);
            }
            Key::Str(s) => {
                self.str_index.remove(&*s);
            }
        }
        if pos < self.entries.len() {
            self.reindex();
        } else {
            self.header.set_size(self.entries.len());
        }
        if self.header.is_packed_shape() {
            self.next_ki = self.len() as i64;
        }
        value
    }

    /// Counted copy with a single reference. Diagnostic and shared-cache
    /// marks are not carried over.
    pub fn copy(ad: &ArrayData) -> NonNull<ArrayData> {
        let src = Self::as_vanilla(ad);
        let aux = src.header.aux16() & !(ArrayData::SAMPLED_ARRAY | ArrayData::HAS_SHARED_ENTRY);
        let mut header = ArrayData::new(src.kind(), RefCountMode::Counted, aux);
        header.set_size(src.len());
        Self {
            header,
            entries: src.entries.clone(),
            int_index: src.int_index.clone(),
            str_index: src.str_index.clone(),
            next_ki: src.next_ki,
        }
        .into_raw()
    }

    // Safety: `ad` must be a live vanilla array the caller holds a reference to
    unsafe fn cow(ad: NonNull<ArrayData>) -> NonNull<ArrayData> {
        if ad.as_ref().has_exactly_one_ref() {
            ad
        } else {
            Self::copy(ad.as_ref())
        }
    }

    /// Replaces `array` by a private copy unless it is already uniquely owned.
    fn make_unique(array: &mut Array) {
        if !array.is_unique() {
            // Safety: the copy carries exactly one reference
            *array = unsafe { Array::from_raw(Self::copy(array.header())) };
        }
    }

    /// Size of the object header and bookkeeping.
    pub fn heap_size(_ad: &ArrayData) -> usize {
        mem::size_of::<VanillaArray>()
    }

    /// Frees a counted array whose last reference was dropped.
    ///
    /// # Safety
    /// `ad` must be a counted vanilla array with no remaining references.
    pub unsafe fn release(ad: NonNull<ArrayData>) {
        debug_assert!(ad.as_ref().is_ref_counted());
        drop(Box::from_raw(ad.cast::<VanillaArray>().as_ptr()));
    }

    /// Returns true if the keys are exactly `0..size`.
    pub fn is_vector_data(ad: &ArrayData) -> bool {
        Self::as_vanilla(ad)
            .entries
            .iter()
            .enumerate()
            .all(|(pos, (key, _))| *key == Key::Int(pos as i64))
    }

    /// Value at an integer key, or `Uninit`.
    pub fn get_int(ad: &ArrayData, key: i64) -> TypedValue {
        let va = Self::as_vanilla(ad);
        va.position_of_int(key)
            .map_or(TypedValue::Uninit, |pos| va.entries[pos].1.clone())
    }

    /// Value at a string key, or `Uninit`.
    pub fn get_str(ad: &ArrayData, key: &str) -> TypedValue {
        let va = Self::as_vanilla(ad);
        va.position_of_str(key)
            .map_or(TypedValue::Uninit, |pos| va.entries[pos].1.clone())
    }

    /// Key at a valid position.
    pub fn get_pos_key(ad: &ArrayData, pos: Pos) -> TypedValue {
        Self::as_vanilla(ad).entries[pos].0.clone().into()
    }

    /// Value at a valid position.
    pub fn get_pos_val(ad: &ArrayData, pos: Pos) -> TypedValue {
        Self::as_vanilla(ad).entries[pos].1.clone()
    }

    /// Position of an integer key, or the end position.
    pub fn get_int_pos(ad: &ArrayData, key: i64) -> Pos {
        let va = Self::as_vanilla(ad);
        va.position_of_int(key).unwrap_or_else(|| va.len())
    }

    /// Position of a string key, or the end position.
    pub fn get_str_pos(ad: &ArrayData, key: &str) -> Pos {
        let va = Self::as_vanilla(ad);
        va.position_of_str(key).unwrap_or_else(|| va.len())
    }

    /// First position.
    pub fn iter_begin(_ad: &ArrayData) -> Pos {
        0
    }

    /// Last valid position, or the end position if empty.
    pub fn iter_last(ad: &ArrayData) -> Pos {
        let len = Self::as_vanilla(ad).len();
        if len == 0 {
            len
        } else {
            len - 1
        }
    }

    /// End position.
    pub fn iter_end(ad: &ArrayData) -> Pos {
        Self::as_vanilla(ad).len()
    }

    /// Next position.
    pub fn iter_advance(ad: &ArrayData, pos: Pos) -> Pos {
        (pos + 1).min(Self::as_vanilla(ad).len())
    }

    /// Previous position, or the end position before the first.
    pub fn iter_rewind(ad: &ArrayData, pos: Pos) -> Pos {
        let len = Self::as_vanilla(ad).len();
        if pos == 0 || pos > len {
            len
        } else {
            pos - 1
        }
    }

    fn lval(array: &mut Array, key: Key) -> &mut TypedValue {
        Self::make_unique(array);
        // Safety: uniquely owned after `make_unique`, borrowed for the lifetime of `array`
        let va = unsafe { Self::as_mut(array.as_ptr()) };
        let pos = match va.position_of(&key) {
            Some(pos) => pos,
            None => va.insert(key, TypedValue::Null),
        };
        &mut va.entries[pos].1
    }

    /// Mutable slot for an integer key, inserting null if missing.
    pub fn lval_int(array: &mut Array, key: i64) -> &mut TypedValue {
        Self::lval(array, Key::Int(key))
    }

    /// Mutable slot for a string key, inserting null if missing.
    pub fn lval_str<'a>(array: &'a mut Array, key: &str) -> &'a mut TypedValue {
        Self::lval(array, Key::str(key))
    }

    /// Mutable slot for an existing integer key.
    pub fn elem_int(
        array: &mut Array,
        key: i64,
        throw_on_missing: bool,
    ) -> Result<Option<&mut TypedValue>, BespokeError> {
        if Self::as_vanilla(array.header()).position_of_int(key).is_none() {
            return BespokeError::missing(throw_on_missing, key);
        }
        Ok(Some(Self::lval(array, Key::Int(key))))
    }

    /// Mutable slot for an existing string key.
    pub fn elem_str<'a>(
        array: &'a mut Array,
        key: &str,
        throw_on_missing: bool,
    ) -> Result<Option<&'a mut TypedValue>, BespokeError> {
        if Self::as_vanilla(array.header()).position_of_str(key).is_none() {
            return BespokeError::missing(throw_on_missing, format_args!("\"{}\"", key));
        }
        Ok(Some(Self::lval(array, Key::str(key))))
    }

    // Safety: `ad` must be a live vanilla array the caller holds a reference to
    unsafe fn set(ad: NonNull<ArrayData>, key: Key, value: TypedValue) -> NonNull<ArrayData> {
        let result = Self::cow(ad);
        Self::as_mut(result).insert(key, value);
        result
    }

    // Safety: as for `set`; the caller's reference is consumed
    unsafe fn set_move(ad: NonNull<ArrayData>, key: Key, value: TypedValue) -> NonNull<ArrayData> {
        let result = Self::set(ad, key, value);
        if result != ad {
            release_ref(ad);
        }
        result
    }

    /// Plain set at an integer key.
    ///
    /// # Safety
    /// `ad` must be a live vanilla array the caller holds a reference to.
    pub unsafe fn set_int(ad: NonNull<ArrayData>, key: i64, value: &TypedValue) -> NonNull<ArrayData> {
        Self::set(ad, Key::Int(key), value.clone())
    }

    /// Plain set at a string key.
    ///
    /// # Safety
    /// As for [`VanillaArray::set_int`].
    pub unsafe fn set_str(ad: NonNull<ArrayData>, key: &str, value: &TypedValue) -> NonNull<ArrayData> {
        Self::set(ad, Key::str(key), value.clone())
    }

    /// Consuming set at an integer key.
    ///
    /// # Safety
    /// As for [`VanillaArray::set_int`]; the caller's reference is consumed.
    pub unsafe fn set_int_move(ad: NonNull<ArrayData>, key: i64, value: TypedValue) -> NonNull<ArrayData> {
        Self::set_move(ad, Key::Int(key), value)
    }

    /// Consuming set at a string key.
    ///
    /// # Safety
    /// As for [`VanillaArray::set_int_move`].
    pub unsafe fn set_str_move(ad: NonNull<ArrayData>, key: &str, value: TypedValue) -> NonNull<ArrayData> {
        Self::set_move(ad, Key::str(key), value)
    }

    // Safety: `ad` must be a live vanilla array the caller holds a reference to
    unsafe fn remove(ad: NonNull<ArrayData>, pos: Option<usize>) -> NonNull<ArrayData> {
        match pos {
            None => ad,
            Some(pos) => {
                let result = Self::cow(ad);
                Self::as_mut(result).remove_at(pos);
                result
            }
        }
    }

    /// Plain removal of an integer key.
    ///
    /// # Safety
    /// `ad` must be a live vanilla array the caller holds a reference to.
    pub unsafe fn remove_int(ad: NonNull<ArrayData>, key: i64) -> NonNull<ArrayData> {
        Self::remove(ad, Self::as_vanilla(ad.as_ref()).position_of_int(key))
    }

    /// Plain removal of a string key.
    ///
    /// # Safety
    /// As for [`VanillaArray::remove_int`].
    pub unsafe fn remove_str(ad: NonNull<ArrayData>, key: &str) -> NonNull<ArrayData> {
        Self::remove(ad, Self::as_vanilla(ad.as_ref()).position_of_str(key))
    }

    /// Plain append.
    ///
    /// # Safety
    /// `ad` must be a live vanilla array the caller holds a reference to.
    pub unsafe fn append(ad: NonNull<ArrayData>, value: &TypedValue) -> NonNull<ArrayData> {
        let result = Self::cow(ad);
        Self::as_mut(result).append_value(value.clone());
        result
    }

    /// Plain pop of the last element. Popping an empty array yields null.
    ///
    /// # Safety
    /// `ad` must be a live vanilla array the caller holds a reference to.
    pub unsafe fn pop(ad: NonNull<ArrayData>, out: &mut TypedValue) -> NonNull<ArrayData> {
        let len = Self::as_vanilla(ad.as_ref()).len();
        if len == 0 {
            *out = TypedValue::Null;
            return ad;
        }
        let result = Self::cow(ad);
        *out = Self::as_mut(result).remove_at(len - 1);
        result
    }

    // Safety: `ad` must be live; when `copy` is false it must be uniquely owned
    unsafe fn convert(
        ad: NonNull<ArrayData>,
        copy: bool,
        f: impl FnOnce(&mut VanillaArray),
    ) -> NonNull<ArrayData> {
        let result = if copy {
            Self::copy(ad.as_ref())
        } else {
            debug_assert!(ad.as_ref().has_exactly_one_ref());
            ad
        };
        f(Self::as_mut(result));
        result
    }

    /// Converts hack categories to their legacy counterparts.
    ///
    /// # Safety
    /// `ad` must be live, and uniquely owned unless `copy` is set.
    pub unsafe fn to_dv_array(ad: NonNull<ArrayData>, copy: bool) -> NonNull<ArrayData> {
        let target = match ad.as_ref().kind() {
            ArrayKind::Vec => ArrayKind::Packed,
            ArrayKind::Dict | ArrayKind::Keyset => ArrayKind::Mixed,
            _ => return ad,
        };
        Self::convert(ad, copy, |va| {
            va.header.set_kind(target);
            va.header.set_legacy_flag(false);
        })
    }

    /// Converts legacy categories to their hack counterparts.
    ///
    /// # Safety
    /// As for [`VanillaArray::to_dv_array`].
    pub unsafe fn to_hack_arr(ad: NonNull<ArrayData>, copy: bool) -> NonNull<ArrayData> {
        let target = match ad.as_ref().kind() {
            ArrayKind::Packed => ArrayKind::Vec,
            ArrayKind::Mixed => ArrayKind::Dict,
            _ => return ad,
        };
        Self::convert(ad, copy, |va| {
            va.header.set_kind(target);
            va.header.set_legacy_flag(false);
        })
    }

    /// Sets or clears the legacy mark of a vec or dict.
    ///
    /// # Safety
    /// As for [`VanillaArray::to_dv_array`].
    pub unsafe fn set_legacy_array(ad: NonNull<ArrayData>, copy: bool, legacy: bool) -> NonNull<ArrayData> {
        let hd = ad.as_ref();
        always_assert!(
            matches!(hd.kind(), ArrayKind::Vec | ArrayKind::Dict),
            "legacy mark requested on a {:?} array",
            hd.kind()
        );
        if hd.is_legacy_array() == legacy {
            return ad;
        }
        Self::convert(ad, copy, |va| va.header.set_legacy_flag(legacy))
    }

    /// Turns packed kinds into the matching mixed kind.
    ///
    /// # Safety
    /// As for [`VanillaArray::to_dv_array`].
    pub unsafe fn to_mixed(ad: NonNull<ArrayData>, copy: bool) -> NonNull<ArrayData> {
        if !ad.as_ref().is_packed_shape() {
            return ad;
        }
        Self::convert(ad, copy, VanillaArray::to_mixed_in_place)
    }

    /// Sorts a uniquely owned array in place.
    ///
    /// Sort-family functions renumber the keys, except on keysets whose keys
    /// must equal their values; there they only reorder. The others keep the
    /// keys, which turns packed kinds into mixed ones.
    ///
    /// # Safety
    /// `ad` must be a live, uniquely owned vanilla array.
    pub unsafe fn sort(ad: NonNull<ArrayData>, sf: SortFunction, cmp: Option<Comparator<'_>>) {
        debug_assert!(ad.as_ref().has_exactly_one_ref());
        let va = Self::as_mut(ad);
        let compare_values = |a: &TypedValue, b: &TypedValue| {
            let order = match cmp {
                Some(cmp) => cmp(a, b),
                None => a.compare(b),
            };
            directed(order, sf.is_reverse())
        };

        if sf.is_sort_family() && va.kind() == ArrayKind::Keyset {
            va.entries.sort_by(|(_, a), (_, b)| compare_values(a, b));
        } else if sf.is_sort_family() {
            let mut values: Vec<TypedValue> = va.entries.drain(..).map(|(_, v)| v).collect();
            values.sort_by(compare_values);
            va.entries = values
                .into_iter()
                .enumerate()
                .map(|(pos, v)| (Key::Int(pos as i64), v))
                .collect();
            va.next_ki = va.entries.len() as i64;
        } else {
            va.to_mixed_in_place();
            if sf.is_key_sort() {
                let compare_keys = |a: &Key, b: &Key| {
                    let order = match cmp {
                        Some(cmp) => cmp(&a.clone().into(), &b.clone().into()),
                        None => a.compare(b),
                    };
                    directed(order, sf.is_reverse())
                };
                va.entries.sort_by(|(a, _), (b, _)| compare_keys(a, b));
            } else {
                va.entries.sort_by(|(_, a), (_, b)| compare_values(a, b));
            }
        }
        va.reindex();
    }

    /// Immortal copy. Nested arrays are promoted as well.
    pub fn copy_static(ad: &ArrayData) -> NonNull<ArrayData> {
        let src = Self::as_vanilla(ad);
        let entries = src
            .entries
            .iter()
            .map(|(key, value)| {
                let value = match value {
                    TypedValue::Arr(a) => TypedValue::Arr(a.clone().into_static()),
                    other => other.clone(),
                };
                (key.clone(), value)
            })
            .collect();
        let aux = src.header.aux16() & ArrayData::LEGACY_ARRAY;
        let mut header = ArrayData::new(src.kind(), RefCountMode::Static, aux);
        header.set_size(src.len());
        Self {
            header,
            entries,
            int_index: src.int_index.clone(),
            str_index: src.str_index.clone(),
            next_ki: src.next_ki,
        }
        .into_raw()
    }

    /// Deep copy into the shared cache. Follows the same dedup and
    /// accounting protocol as bespoke arrays.
    pub fn make_uncounted(
        ad: NonNull<ArrayData>,
        has_shared_entry: bool,
        heap: &UncountedHeap<'_>,
        mut seen: Option<&mut dyn DedupMap>,
    ) -> NonNull<ArrayData> {
        // Safety: the caller holds a reference
        let src = Self::as_vanilla(unsafe { ad.as_ref() });
        always_assert!(
            src.header.is_ref_counted(),
            "make_uncounted on {:?} array {:p}",
            src.header.mode(),
            ad
        );
        let update_seen = seen.is_some() && src.header.has_multiple_refs();
        if update_seen {
            if let Some(existing) = reuse_seen(ad, &seen) {
                return existing;
            }
        }

        let extra = uncounted_alloc_extra(src.kind(), has_shared_entry);
        let bytes = mem::size_of::<VanillaArray>();
        let mem = heap.allocate(extra + bytes);

        let entries = src
            .entries
            .iter()
            .map(|(key, value)| (key.clone(), to_uncounted_value(value, heap, reborrow(&mut seen))))
            .collect();
        let mut aux = src.header.aux16() & !ArrayData::HAS_SHARED_ENTRY;
        if has_shared_entry {
            aux |= ArrayData::HAS_SHARED_ENTRY;
        }
        let mut header = ArrayData::new(src.kind(), RefCountMode::Uncounted, aux);
        header.set_size(src.len());
        let copy = Self {
            header,
            entries,
            int_index: src.int_index.clone(),
            str_index: src.str_index.clone(),
            next_ki: src.next_ki,
        };

        // Safety: `mem` holds `extra + bytes` bytes aligned to 16
        let result = unsafe {
            let obj = mem.as_ptr().add(extra).cast::<VanillaArray>();
            obj.write(copy);
            NonNull::new_unchecked(obj).cast::<ArrayData>()
        };
        if update_seen {
            if let Some(seen) = seen {
                seen.record(ad, result);
            }
        }
        heap.add_uncounted_block();
        result
    }

    /// Drops a reference to an uncounted array, tearing it down at zero.
    ///
    /// # Safety
    /// `ad` must be an uncounted vanilla array produced by
    /// [`VanillaArray::make_uncounted`] on an allocator equal to `heap`'s.
    pub unsafe fn release_uncounted(ad: NonNull<ArrayData>, heap: &UncountedHeap<'_>) {
        let hd = ad.as_ref();
        always_assert!(hd.is_uncounted(), "release_uncounted on {:?} array {:p}", hd.mode(), ad);
        if !hd.uncounted_dec_ref() {
            return;
        }
        let va = Self::as_mut(ad);
        for (_, value) in mem::take(&mut va.entries) {
            release_uncounted_value(value, heap);
        }
        let extra = uncounted_alloc_extra(va.kind(), va.header.has_shared_entry());
        ptr::drop_in_place(va as *mut VanillaArray);
        heap.remove_uncounted_block();
        heap.free(
            NonNull::new_unchecked(ad.as_ptr().cast::<u8>().sub(extra)),
            extra + mem::size_of::<VanillaArray>(),
        );
    }
}

fn directed(order: Ordering, reverse: bool) -> Ordering {
    if reverse {
        order.reverse()
    } else {
        order
    }
}
