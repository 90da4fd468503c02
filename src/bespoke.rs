//! Dispatch for bespoke arrays
//!
//! A bespoke array stores its layout index in the upper 16 bits of the
//! header's extra field, next to [`EXTRA_MAGIC_BIT`]. Every operation looks
//! the layout up in the installed registry and forwards to its
//! [`LayoutFunctions`] entry unchanged; there is no fallback behavior.

use std::fmt::{self, Debug, Formatter};
use std::ptr::NonNull;

use crate::array::{release_ref, Array};
use crate::error::BespokeError;
use crate::header::{ArrayData, ArrayKind, LayoutIndex, RefCountMode, EXTRA_MAGIC_BIT};
use crate::layout::{layouts, ConcreteLayout, LayoutFunctions, Pos};
use crate::logging_array::{LoggingArray, SrcKey, TransId};
use crate::value::TypedValue;

const CHECK_INVARIANTS: bool = cfg!(any(debug_assertions, feature = "invariant-checks"));

/// View of an [`ArrayData`] header that belongs to a bespoke array.
#[repr(transparent)]
pub struct BespokeArray(ArrayData);

impl BespokeArray {
    /// Header for a new counted bespoke array of `kind` using layout `index`.
    pub fn header(kind: ArrayKind, index: LayoutIndex) -> ArrayData {
        debug_assert!(!kind.is_vanilla());
        let mut array = BespokeArray(ArrayData::new(kind, RefCountMode::Counted, 0));
        array.set_layout_index(index);
        array.0
    }

    /// Reinterprets a header as a bespoke array, checking invariants in
    /// debug builds.
    pub fn as_bespoke(ad: &ArrayData) -> &BespokeArray {
        // Safety: `BespokeArray` is a transparent wrapper
        let bad = unsafe { &*(ad as *const ArrayData).cast::<BespokeArray>() };
        if CHECK_INVARIANTS {
            bad.check_invariants();
        }
        bad
    }

    /// Reinterprets a header as a bespoke array without any check, so that
    /// factories can finish initializing it.
    ///
    /// # Safety
    /// `ad` must be live and not aliased for `'a`.
    pub unsafe fn from_raw_mut<'a>(ad: NonNull<ArrayData>) -> &'a mut BespokeArray {
        &mut *ad.cast::<BespokeArray>().as_ptr()
    }

    /// The underlying header.
    pub fn array_data(&self) -> &ArrayData {
        &self.0
    }

    /// The layout index, with the discriminator bit masked off.
    pub fn layout_index(&self) -> LayoutIndex {
        LayoutIndex::from_slot(self.0.extra_hi16())
    }

    /// Stores the layout index together with the discriminator bit.
    pub fn set_layout_index(&mut self, index: LayoutIndex) {
        self.0.set_extra_hi16(index.raw() | EXTRA_MAGIC_BIT);
    }

    /// The registered layout. An unregistered index is fatal.
    pub fn layout(&self) -> &'static ConcreteLayout {
        let index = self.layout_index();
        match layouts().resolve(index) {
            Some(layout) => layout,
            None => fatal!("bespoke array {:p} has unregistered layout {}", &self.0, index),
        }
    }

    /// The layout's operation table.
    pub fn vtable(&self) -> &'static LayoutFunctions {
        self.layout().vtable()
    }

    /// Bytes occupied by the object.
    pub fn heap_size(&self) -> usize {
        (self.vtable().heap_size)(&self.0)
    }

    /// Verifies the header of a bespoke array. Any violation is fatal;
    /// returns true otherwise so it can sit inside `debug_assert!`.
    pub fn check_invariants(&self) -> bool {
        let ad = &self.0;
        always_assert!(!ad.is_vanilla(), "bespoke array {:p} carries a vanilla kind", ad);
        always_assert!(ad.kind_is_valid(), "bespoke array {:p} has invalid kind {:#x}", ad, ad.raw_kind());
        always_assert!(!ad.is_sampled_array(), "bespoke array {:p} is flagged as sampled", ad);
        always_assert!(
            ad.extra_hi16() & EXTRA_MAGIC_BIT != 0,
            "bespoke array {:p} is missing the layout discriminator bit",
            ad
        );
        always_assert!(
            layouts().resolve(self.layout_index()).is_some(),
            "bespoke array {:p} has unregistered layout {}",
            ad,
            self.layout_index()
        );
        true
    }

    /// Records that a translation reached a source location with this
    /// array. Only the sampling layout keeps these events.
    pub fn log_reach_event(&self, trans_id: TransId, src_key: SrcKey) {
        if self.layout_index() != LoggingArray::LAYOUT_INDEX {
            return;
        }
        LoggingArray::as_logging(&self.0).log_reach_event(trans_id, src_key);
    }

    fn vtable_of(ad: &ArrayData) -> &'static LayoutFunctions {
        Self::as_bespoke(ad).vtable()
    }

    fn checked(result: NonNull<ArrayData>) -> NonNull<ArrayData> {
        if CHECK_INVARIANTS {
            // Safety: layout entries return live arrays
            let hd = unsafe { result.as_ref() };
            if !hd.is_vanilla() {
                Self::as_bespoke(hd);
            }
        }
        result
    }

    fn trace_escalation(layout: &ConcreteLayout, op: &'static str, result: NonNull<ArrayData>) {
        // Safety: layout entries return live arrays
        let escalated = unsafe { result.as_ref() }.is_vanilla();
        if escalated {
            tracing::debug!(target: "bespoke", layout = layout.name(), op, "escalated to vanilla");
        }
    }

    /// Canonical copy of a bespoke array.
    pub fn to_vanilla(ad: &ArrayData, reason: &'static str) -> NonNull<ArrayData> {
        let layout = Self::as_bespoke(ad).layout();
        let result = (layout.vtable().escalate_to_vanilla)(ad, reason);
        // Safety: escalation returns a live array
        let vanilla = unsafe { result.as_ref() }.is_vanilla();
        always_assert!(
            vanilla,
            "layout {} escalated to a non-vanilla array",
            layout.name()
        );
        tracing::debug!(target: "bespoke", layout = layout.name(), reason, "escalated to vanilla");
        result
    }

    /// Frees a counted bespoke array whose last reference was dropped.
    ///
    /// # Safety
    /// `ad` must be a counted bespoke array with no remaining references.
    pub unsafe fn release(ad: NonNull<ArrayData>) {
        (Self::vtable_of(ad.as_ref()).release)(ad)
    }

    /// Returns true if the keys are exactly `0..size`.
    pub fn is_vector_data(ad: &ArrayData) -> bool {
        (Self::vtable_of(ad).is_vector_data)(ad)
    }

    /// Value at an integer key, or `Uninit`.
    pub fn get_int(ad: &ArrayData, key: i64) -> TypedValue {
        (Self::vtable_of(ad).get_int)(ad, key)
    }

    /// Value at a string key, or `Uninit`.
    pub fn get_str(ad: &ArrayData, key: &str) -> TypedValue {
        (Self::vtable_of(ad).get_str)(ad, key)
    }

    /// Key at a valid position.
    pub fn get_pos_key(ad: &ArrayData, pos: Pos) -> TypedValue {
        (Self::vtable_of(ad).get_pos_key)(ad, pos)
    }

    /// Value at a valid position.
    pub fn get_pos_val(ad: &ArrayData, pos: Pos) -> TypedValue {
        (Self::vtable_of(ad).get_pos_val)(ad, pos)
    }

    /// Position of an integer key, or the end position.
    pub fn get_int_pos(ad: &ArrayData, key: i64) -> Pos {
        (Self::vtable_of(ad).get_int_pos)(ad, key)
    }

    /// Position of a string key, or the end position.
    pub fn get_str_pos(ad: &ArrayData, key: &str) -> Pos {
        (Self::vtable_of(ad).get_str_pos)(ad, key)
    }

    /// Returns true if the integer key is present.
    pub fn exists_int(ad: &ArrayData, key: i64) -> bool {
        Self::get_int(ad, key).is_init()
    }

    /// Returns true if the string key is present.
    pub fn exists_str(ad: &ArrayData, key: &str) -> bool {
        Self::get_str(ad, key).is_init()
    }

    /// First position.
    pub fn iter_begin(ad: &ArrayData) -> Pos {
        (Self::vtable_of(ad).iter_begin)(ad)
    }

    /// Last valid position.
    pub fn iter_last(ad: &ArrayData) -> Pos {
        (Self::vtable_of(ad).iter_last)(ad)
    }

    /// End sentinel.
    pub fn iter_end(ad: &ArrayData) -> Pos {
        (Self::vtable_of(ad).iter_end)(ad)
    }

    /// Next position.
    pub fn iter_advance(ad: &ArrayData, pos: Pos) -> Pos {
        (Self::vtable_of(ad).iter_advance)(ad, pos)
    }

    /// Previous position.
    pub fn iter_rewind(ad: &ArrayData, pos: Pos) -> Pos {
        (Self::vtable_of(ad).iter_rewind)(ad, pos)
    }

    /// Mutable slot for an integer key, inserting null if missing.
    pub fn lval_int(array: &mut Array, key: i64) -> &mut TypedValue {
        (Self::vtable_of(array.header()).lval_int)(array, key)
    }

    /// Mutable slot for a string key, inserting null if missing.
    pub fn lval_str<'a>(array: &'a mut Array, key: &str) -> &'a mut TypedValue {
        (Self::vtable_of(array.header()).lval_str)(array, key)
    }

    /// Mutable slot for an existing integer key.
    pub fn elem_int(
        array: &mut Array,
        key: i64,
        throw_on_missing: bool,
    ) -> Result<Option<&mut TypedValue>, BespokeError> {
        (Self::vtable_of(array.header()).elem_int)(array, key, throw_on_missing)
    }

    /// Mutable slot for an existing string key.
    pub fn elem_str<'a>(
        array: &'a mut Array,
        key: &str,
        throw_on_missing: bool,
    ) -> Result<Option<&'a mut TypedValue>, BespokeError> {
        (Self::vtable_of(array.header()).elem_str)(array, key, throw_on_missing)
    }

    /// Plain set at an integer key.
    ///
    /// # Safety
    /// `ad` must be a live bespoke array the caller holds a reference to.
    pub unsafe fn set_int(ad: NonNull<ArrayData>, key: i64, value: &TypedValue) -> NonNull<ArrayData> {
        let layout = Self::as_bespoke(ad.as_ref()).layout();
        let result = Self::checked((layout.vtable().set_int)(ad, key, value));
        Self::trace_escalation(layout, "set_int", result);
        result
    }

    /// Plain set at a string key.
    ///
    /// # Safety
    /// As for [`BespokeArray::set_int`].
    pub unsafe fn set_str(ad: NonNull<ArrayData>, key: &str, value: &TypedValue) -> NonNull<ArrayData> {
        let layout = Self::as_bespoke(ad.as_ref()).layout();
        let result = Self::checked((layout.vtable().set_str)(ad, key, value));
        Self::trace_escalation(layout, "set_str", result);
        result
    }

    /// Consuming set at an integer key.
    ///
    /// # Safety
    /// As for [`BespokeArray::set_int`]; the caller's reference is consumed.
    pub unsafe fn set_int_move(ad: NonNull<ArrayData>, key: i64, value: TypedValue) -> NonNull<ArrayData> {
        let layout = Self::as_bespoke(ad.as_ref()).layout();
        let result = Self::checked((layout.vtable().set_int_move)(ad, key, value));
        Self::trace_escalation(layout, "set_int_move", result);
        result
    }

    /// Consuming set at a string key.
    ///
    /// # Safety
    /// As for [`BespokeArray::set_int_move`].
    pub unsafe fn set_str_move(ad: NonNull<ArrayData>, key: &str, value: TypedValue) -> NonNull<ArrayData> {
        let layout = Self::as_bespoke(ad.as_ref()).layout();
        let result = Self::checked((layout.vtable().set_str_move)(ad, key, value));
        Self::trace_escalation(layout, "set_str_move", result);
        result
    }

    /// Plain removal of an integer key.
    ///
    /// # Safety
    /// As for [`BespokeArray::set_int`].
    pub unsafe fn remove_int(ad: NonNull<ArrayData>, key: i64) -> NonNull<ArrayData> {
        let layout = Self::as_bespoke(ad.as_ref()).layout();
        let result = Self::checked((layout.vtable().remove_int)(ad, key));
        Self::trace_escalation(layout, "remove_int", result);
        result
    }

    /// Plain removal of a string key.
    ///
    /// # Safety
    /// As for [`BespokeArray::set_int`].
    pub unsafe fn remove_str(ad: NonNull<ArrayData>, key: &str) -> NonNull<ArrayData> {
        let layout = Self::as_bespoke(ad.as_ref()).layout();
        let result = Self::checked((layout.vtable().remove_str)(ad, key));
        Self::trace_escalation(layout, "remove_str", result);
        result
    }

    /// Plain append.
    ///
    /// # Safety
    /// As for [`BespokeArray::set_int`].
    pub unsafe fn append(ad: NonNull<ArrayData>, value: &TypedValue) -> NonNull<ArrayData> {
        let layout = Self::as_bespoke(ad.as_ref()).layout();
        let result = Self::checked((layout.vtable().append)(ad, value));
        Self::trace_escalation(layout, "append", result);
        result
    }

    /// Appends, then releases the prior array if a new one came back. The
    /// value is consumed.
    ///
    /// # Safety
    /// As for [`BespokeArray::set_int`]; the caller's reference is consumed.
    pub unsafe fn append_move(ad: NonNull<ArrayData>, value: TypedValue) -> NonNull<ArrayData> {
        let result = Self::append(ad, &value);
        if result != ad {
            release_ref(ad);
        }
        drop(value);
        result
    }

    /// Plain pop; the removed value is written to `out`.
    ///
    /// # Safety
    /// As for [`BespokeArray::set_int`].
    pub unsafe fn pop(ad: NonNull<ArrayData>, out: &mut TypedValue) -> NonNull<ArrayData> {
        let layout = Self::as_bespoke(ad.as_ref()).layout();
        let result = Self::checked((layout.vtable().pop)(ad, out));
        Self::trace_escalation(layout, "pop", result);
        result
    }

    /// Conversion to the legacy categories.
    ///
    /// # Safety
    /// `ad` must be live, and uniquely owned unless `copy` is set.
    pub unsafe fn to_dv_array(ad: NonNull<ArrayData>, copy: bool) -> NonNull<ArrayData> {
        let layout = Self::as_bespoke(ad.as_ref()).layout();
        let result = Self::checked((layout.vtable().to_dv_array)(ad, copy));
        Self::trace_escalation(layout, "to_dv_array", result);
        result
    }

    /// Conversion to the hack categories.
    ///
    /// # Safety
    /// As for [`BespokeArray::to_dv_array`].
    pub unsafe fn to_hack_arr(ad: NonNull<ArrayData>, copy: bool) -> NonNull<ArrayData> {
        let layout = Self::as_bespoke(ad.as_ref()).layout();
        let result = Self::checked((layout.vtable().to_hack_arr)(ad, copy));
        Self::trace_escalation(layout, "to_hack_arr", result);
        result
    }

    /// Sets or clears the legacy mark.
    ///
    /// # Safety
    /// As for [`BespokeArray::to_dv_array`].
    pub unsafe fn set_legacy_array(ad: NonNull<ArrayData>, copy: bool, legacy: bool) -> NonNull<ArrayData> {
        let layout = Self::as_bespoke(ad.as_ref()).layout();
        let result = Self::checked((layout.vtable().set_legacy_array)(ad, copy, legacy));
        Self::trace_escalation(layout, "set_legacy_array", result);
        result
    }

    /// Bespoke arrays are never finalized as static scalars; they must be
    /// escalated first.
    pub fn on_set_eval_scalar(ad: &ArrayData) -> ! {
        fatal!(
            "on_set_eval_scalar called on bespoke array {:p} ({})",
            ad,
            Self::as_bespoke(ad).layout().name()
        )
    }

    /// Bespoke arrays never become static; they must be escalated first.
    pub fn copy_static(ad: &ArrayData) -> ! {
        fatal!(
            "copy_static called on bespoke array {:p} ({})",
            ad,
            Self::as_bespoke(ad).layout().name()
        )
    }
}

impl Debug for BespokeArray {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("BespokeArray")
            .field("layout", &self.layout_index())
            .field("header", &self.0)
            .finish()
    }
}
