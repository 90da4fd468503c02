//! The generic array handle
//!
//! [`Array`] owns one reference to an array object in any representation and
//! routes every operation either to [`VanillaArray`] or, for bespoke arrays,
//! through the [`BespokeArray`] dispatcher.

use std::fmt::{self, Debug, Formatter};
use std::iter::FusedIterator;
use std::mem;
use std::ptr::NonNull;

use crate::bespoke::BespokeArray;
use crate::error::BespokeError;
use crate::header::{ArrayData, ArrayKind, ArrayType};
use crate::layout::Pos;
use crate::vanilla::VanillaArray;
use crate::value::{Key, TypedValue};

/// Owning handle to an array object.
///
/// Cloning takes a reference and dropping releases one. Both are no-ops for
/// static arrays. An uncounted array can only be freed through the heap it
/// was allocated from, so dropping its last reference here is fatal; hand
/// the handle to [`crate::SharedArray::try_from_array`] and release that
/// instead.
/// Mutating methods consume the handle and
/// return the resulting array, which is the same object when it was uniquely
/// owned and could be updated in place.
#[repr(transparent)]
pub struct Array(NonNull<ArrayData>);

/// Drops one counted reference to `ad`, releasing the object at zero.
///
/// # Safety
/// The caller must own the reference being dropped.
pub(crate) unsafe fn release_ref(ad: NonNull<ArrayData>) {
    drop(Array::from_raw(ad));
}

impl Array {
    /// Adopts one reference to `ptr`.
    ///
    /// # Safety
    /// `ptr` must point to a live array object and the caller must transfer
    /// ownership of one reference.
    pub unsafe fn from_raw(ptr: NonNull<ArrayData>) -> Self {
        Array(ptr)
    }

    /// Gives up the handle without dropping its reference.
    pub fn into_raw(self) -> NonNull<ArrayData> {
        let ptr = self.0;
        mem::forget(self);
        ptr
    }

    /// Raw pointer to the object.
    pub fn as_ptr(&self) -> NonNull<ArrayData> {
        self.0
    }

    /// The object header.
    pub fn header(&self) -> &ArrayData {
        // Safety: we hold a reference
        unsafe { self.0.as_ref() }
    }

    /// Returns true if both handles point to the same object.
    pub fn ptr_eq(&self, other: &Array) -> bool {
        self.0 == other.0
    }

    /// Empty array of a vanilla kind.
    pub fn new(kind: ArrayKind) -> Self {
        VanillaArray::make(kind)
    }

    /// Vanilla vec built from `values`.
    pub fn vec<V: Into<TypedValue>>(values: impl IntoIterator<Item = V>) -> Self {
        VanillaArray::from_values(ArrayKind::Vec, values.into_iter().map(Into::into))
    }

    /// Vanilla varray built from `values`.
    pub fn varray<V: Into<TypedValue>>(values: impl IntoIterator<Item = V>) -> Self {
        VanillaArray::from_values(ArrayKind::Packed, values.into_iter().map(Into::into))
    }

    /// Vanilla keyset built from `values`.
    pub fn keyset<V: Into<TypedValue>>(values: impl IntoIterator<Item = V>) -> Self {
        VanillaArray::from_values(ArrayKind::Keyset, values.into_iter().map(Into::into))
    }

    /// Vanilla dict built from `entries`.
    pub fn dict<K: Into<Key>, V: Into<TypedValue>>(
        entries: impl IntoIterator<Item = (K, V)>,
    ) -> Self {
        VanillaArray::from_entries(
            ArrayKind::Dict,
            entries.into_iter().map(|(k, v)| (k.into(), v.into())),
        )
    }

    /// Vanilla darray built from `entries`.
    pub fn darray<K: Into<Key>, V: Into<TypedValue>>(
        entries: impl IntoIterator<Item = (K, V)>,
    ) -> Self {
        VanillaArray::from_entries(
            ArrayKind::Mixed,
            entries.into_iter().map(|(k, v)| (k.into(), v.into())),
        )
    }

    /// Physical kind.
    pub fn kind(&self) -> ArrayKind {
        self.header().kind()
    }

    /// User-visible category.
    pub fn array_type(&self) -> ArrayType {
        self.header().array_type()
    }

    /// Returns true for canonical arrays.
    pub fn is_vanilla(&self) -> bool {
        self.header().is_vanilla()
    }

    /// Returns true for bespoke arrays.
    pub fn is_bespoke(&self) -> bool {
        !self.is_vanilla()
    }

    /// Number of elements.
    pub fn size(&self) -> usize {
        self.header().size()
    }

    /// Returns true if there are no elements.
    pub fn is_empty(&self) -> bool {
        self.header().is_empty()
    }

    /// Reference count in the array's domain.
    pub fn ref_count(&self) -> u32 {
        self.header().ref_count()
    }

    /// Returns true if mutations may happen in place.
    pub fn is_unique(&self) -> bool {
        self.header().has_exactly_one_ref()
    }

    fn bespoke(&self) -> &BespokeArray {
        BespokeArray::as_bespoke(self.header())
    }

    /// Returns true if the keys are exactly `0..size`.
    pub fn is_vector_data(&self) -> bool {
        if self.is_vanilla() {
            VanillaArray::is_vector_data(self.header())
        } else {
            BespokeArray::is_vector_data(self.header())
        }
    }

    /// Value at an integer key, or `Uninit`.
    pub fn get_int(&self, key: i64) -> TypedValue {
        if self.is_vanilla() {
            VanillaArray::get_int(self.header(), key)
        } else {
            BespokeArray::get_int(self.header(), key)
        }
    }

    /// Value at a string key, or `Uninit`.
    pub fn get_str(&self, key: &str) -> TypedValue {
        if self.is_vanilla() {
            VanillaArray::get_str(self.header(), key)
        } else {
            BespokeArray::get_str(self.header(), key)
        }
    }

    /// Value at `key`, or `Uninit`.
    pub fn get(&self, key: &Key) -> TypedValue {
        match key {
            Key::Int(k) => self.get_int(*k),
            Key::Str(s) => self.get_str(s),
        }
    }

    /// Returns true if the integer key is present.
    pub fn exists_int(&self, key: i64) -> bool {
        if self.is_vanilla() {
            VanillaArray::get_int(self.header(), key).is_init()
        } else {
            BespokeArray::exists_int(self.header(), key)
        }
    }

    /// Returns true if the string key is present.
    pub fn exists_str(&self, key: &str) -> bool {
        if self.is_vanilla() {
            VanillaArray::get_str(self.header(), key).is_init()
        } else {
            BespokeArray::exists_str(self.header(), key)
        }
    }

    /// Key at a valid position.
    pub fn get_pos_key(&self, pos: Pos) -> TypedValue {
        if self.is_vanilla() {
            VanillaArray::get_pos_key(self.header(), pos)
        } else {
            BespokeArray::get_pos_key(self.header(), pos)
        }
    }

    /// Value at a valid position.
    pub fn get_pos_val(&self, pos: Pos) -> TypedValue {
        if self.is_vanilla() {
            VanillaArray::get_pos_val(self.header(), pos)
        } else {
            BespokeArray::get_pos_val(self.header(), pos)
        }
    }

    /// Position of an integer key, or [`Array::iter_end`].
    pub fn get_int_pos(&self, key: i64) -> Pos {
        if self.is_vanilla() {
            VanillaArray::get_int_pos(self.header(), key)
        } else {
            BespokeArray::get_int_pos(self.header(), key)
        }
    }

    /// Position of a string key, or [`Array::iter_end`].
    pub fn get_str_pos(&self, key: &str) -> Pos {
        if self.is_vanilla() {
            VanillaArray::get_str_pos(self.header(), key)
        } else {
            BespokeArray::get_str_pos(self.header(), key)
        }
    }

    /// First position.
    pub fn iter_begin(&self) -> Pos {
        if self.is_vanilla() {
            VanillaArray::iter_begin(self.header())
        } else {
            BespokeArray::iter_begin(self.header())
        }
    }

    /// Last valid position, or [`Array::iter_end`] when empty.
    pub fn iter_last(&self) -> Pos {
        if self.is_vanilla() {
            VanillaArray::iter_last(self.header())
        } else {
            BespokeArray::iter_last(self.header())
        }
    }

    /// End sentinel.
    pub fn iter_end(&self) -> Pos {
        if self.is_vanilla() {
            VanillaArray::iter_end(self.header())
        } else {
            BespokeArray::iter_end(self.header())
        }
    }

    /// Next position.
    pub fn iter_advance(&self, pos: Pos) -> Pos {
        if self.is_vanilla() {
            VanillaArray::iter_advance(self.header(), pos)
        } else {
            BespokeArray::iter_advance(self.header(), pos)
        }
    }

    /// Previous position.
    pub fn iter_rewind(&self, pos: Pos) -> Pos {
        if self.is_vanilla() {
            VanillaArray::iter_rewind(self.header(), pos)
        } else {
            BespokeArray::iter_rewind(self.header(), pos)
        }
    }

    /// Iterates over `(key, value)` pairs in order.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            pos: self.iter_begin(),
            end: self.iter_end(),
            array: self,
        }
    }

    /// Mutable slot for an integer key, inserting null if missing.
    pub fn lval_int(&mut self, key: i64) -> &mut TypedValue {
        if self.is_vanilla() {
            VanillaArray::lval_int(self, key)
        } else {
            BespokeArray::lval_int(self, key)
        }
    }

    /// Mutable slot for a string key, inserting null if missing.
    pub fn lval_str(&mut self, key: &str) -> &mut TypedValue {
        if self.is_vanilla() {
            VanillaArray::lval_str(self, key)
        } else {
            BespokeArray::lval_str(self, key)
        }
    }

    /// Mutable slot for an existing integer key.
    pub fn elem_int(
        &mut self,
        key: i64,
        throw_on_missing: bool,
    ) -> Result<Option<&mut TypedValue>, BespokeError> {
        if self.is_vanilla() {
            VanillaArray::elem_int(self, key, throw_on_missing)
        } else {
            BespokeArray::elem_int(self, key, throw_on_missing)
        }
    }

    /// Mutable slot for an existing string key.
    pub fn elem_str(
        &mut self,
        key: &str,
        throw_on_missing: bool,
    ) -> Result<Option<&mut TypedValue>, BespokeError> {
        if self.is_vanilla() {
            VanillaArray::elem_str(self, key, throw_on_missing)
        } else {
            BespokeArray::elem_str(self, key, throw_on_missing)
        }
    }

    /// Wraps the result of a plain operation, keeping our reference if the
    /// object was reused and dropping it otherwise.
    fn replace(self, result: NonNull<ArrayData>) -> Array {
        if result == self.0 {
            mem::forget(self);
        } else {
            drop(self);
        }
        // Safety: plain operations hand back one reference
        unsafe { Array::from_raw(result) }
    }

    /// Sets the value at an integer key.
    pub fn set_int(self, key: i64, value: impl Into<TypedValue>) -> Array {
        let vanilla = self.is_vanilla();
        let ad = self.into_raw();
        // Safety: the move variants consume the reference we just released
        unsafe {
            Array::from_raw(if vanilla {
                VanillaArray::set_int_move(ad, key, value.into())
            } else {
                BespokeArray::set_int_move(ad, key, value.into())
            })
        }
    }

    /// Sets the value at a string key.
    pub fn set_str(self, key: &str, value: impl Into<TypedValue>) -> Array {
        let vanilla = self.is_vanilla();
        let ad = self.into_raw();
        // Safety: the move variants consume the reference we just released
        unsafe {
            Array::from_raw(if vanilla {
                VanillaArray::set_str_move(ad, key, value.into())
            } else {
                BespokeArray::set_str_move(ad, key, value.into())
            })
        }
    }

    /// Removes an integer key.
    pub fn remove_int(self, key: i64) -> Array {
        // Safety: we hold a reference for the duration of the call
        let result = unsafe {
            if self.is_vanilla() {
                VanillaArray::remove_int(self.0, key)
            } else {
                BespokeArray::remove_int(self.0, key)
            }
        };
        self.replace(result)
    }

    /// Removes a string key.
    pub fn remove_str(self, key: &str) -> Array {
        // Safety: we hold a reference for the duration of the call
        let result = unsafe {
            if self.is_vanilla() {
                VanillaArray::remove_str(self.0, key)
            } else {
                BespokeArray::remove_str(self.0, key)
            }
        };
        self.replace(result)
    }

    /// Appends a value under the next integer key.
    pub fn append(self, value: impl Into<TypedValue>) -> Array {
        let value = value.into();
        if self.is_vanilla() {
            // Safety: we hold a reference for the duration of the call
            let result = unsafe { VanillaArray::append(self.0, &value) };
            self.replace(result)
        } else {
            let ad = self.into_raw();
            // Safety: `append_move` consumes the reference we just released
            unsafe { Array::from_raw(BespokeArray::append_move(ad, value)) }
        }
    }

    /// Removes the last element, returning it with the resulting array.
    /// Popping an empty array yields null.
    pub fn pop(self) -> (Array, TypedValue) {
        let mut out = TypedValue::Uninit;
        // Safety: we hold a reference for the duration of the call
        let result = unsafe {
            if self.is_vanilla() {
                VanillaArray::pop(self.0, &mut out)
            } else {
                BespokeArray::pop(self.0, &mut out)
            }
        };
        (self.replace(result), out)
    }

    /// Converts to the legacy category (varray or darray).
    pub fn to_dv_array(self) -> Array {
        let copy = !self.is_unique();
        // Safety: in-place conversion only happens when uniquely owned
        let result = unsafe {
            if self.is_vanilla() {
                VanillaArray::to_dv_array(self.0, copy)
            } else {
                BespokeArray::to_dv_array(self.0, copy)
            }
        };
        self.replace(result)
    }

    /// Converts to the hack category (vec or dict).
    pub fn to_hack_arr(self) -> Array {
        let copy = !self.is_unique();
        // Safety: in-place conversion only happens when uniquely owned
        let result = unsafe {
            if self.is_vanilla() {
                VanillaArray::to_hack_arr(self.0, copy)
            } else {
                BespokeArray::to_hack_arr(self.0, copy)
            }
        };
        self.replace(result)
    }

    /// Sets or clears the legacy mark of a vec or dict.
    pub fn set_legacy_array(self, legacy: bool) -> Array {
        let copy = !self.is_unique();
        // Safety: in-place conversion only happens when uniquely owned
        let result = unsafe {
            if self.is_vanilla() {
                VanillaArray::set_legacy_array(self.0, copy, legacy)
            } else {
                BespokeArray::set_legacy_array(self.0, copy, legacy)
            }
        };
        self.replace(result)
    }

    /// Canonical representation of the same contents. Vanilla arrays are
    /// returned as is.
    pub fn to_vanilla(self, reason: &'static str) -> Array {
        if self.is_vanilla() {
            return self;
        }
        let vad = BespokeArray::to_vanilla(self.header(), reason);
        // Safety: escalation hands back a fresh reference
        unsafe { Array::from_raw(vad) }
    }

    /// Promotes the array to the static domain. Bespoke arrays reach the
    /// canonical representation first.
    pub fn into_static(self) -> Array {
        if self.header().is_static() {
            return self;
        }
        let vanilla = self.to_vanilla("into_static");
        let sad = VanillaArray::copy_static(vanilla.header());
        // Safety: static arrays ignore reference counting
        unsafe { Array::from_raw(sad) }
    }
}

impl Clone for Array {
    fn clone(&self) -> Self {
        let hd = self.header();
        if hd.is_uncounted() {
            always_assert!(hd.uncounted_inc_ref(), "clone of released uncounted array {:p}", hd);
        } else {
            hd.inc_ref_count();
        }
        Array(self.0)
    }
}

impl Drop for Array {
    fn drop(&mut self) {
        let hd = self.header();
        if hd.is_uncounted() {
            if hd.uncounted_dec_ref() {
                fatal!("last reference to uncounted array {:p} dropped without its heap", hd);
            }
            return;
        }
        if hd.dec_ref_count() {
            // Safety: that was the last counted reference
            unsafe {
                if self.is_vanilla() {
                    VanillaArray::release(self.0)
                } else {
                    BespokeArray::release(self.0)
                }
            }
        }
    }
}

impl PartialEq for Array {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
            || (self.array_type() == other.array_type()
                && self.size() == other.size()
                && self.iter().zip(other.iter()).all(|(a, b)| a == b))
    }
}

impl Debug for Array {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.is_bespoke() {
            write!(f, "{}", self.bespoke().layout().name())?;
        }
        f.write_str(match self.array_type() {
            ArrayType::VArray => "varray",
            ArrayType::DArray => "darray",
            ArrayType::Vec => "vec",
            ArrayType::Dict => "dict",
            ArrayType::Keyset => "keyset",
        })?;
        f.debug_map().entries(self.iter()).finish()
    }
}

/// Iterator over the `(key, value)` pairs of an [`Array`].
pub struct Iter<'a> {
    array: &'a Array,
    pos: Pos,
    end: Pos,
}

impl Iterator for Iter<'_> {
    type Item = (TypedValue, TypedValue);

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos == self.end {
            return None;
        }
        let item = (
            self.array.get_pos_key(self.pos),
            self.array.get_pos_val(self.pos),
        );
        self.pos = self.array.iter_advance(self.pos);
        Some(item)
    }
}

impl FusedIterator for Iter<'_> {}

impl Debug for Iter<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Iter")
            .field("pos", &self.pos)
            .field("end", &self.end)
            .finish()
    }
}
