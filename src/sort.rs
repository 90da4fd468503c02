//! Sorting bespoke arrays by escalating to the canonical representation
//!
//! A bespoke array is never sorted directly. The request escalates to a
//! vanilla snapshot, the generic routine sorts the snapshot in place, and the
//! result is either kept as is (its category changed) or handed back to the
//! layout to re-absorb.

use std::cmp::Ordering;
use std::fmt;
use std::ptr::NonNull;

use crate::array::Array;
use crate::bespoke::BespokeArray;
use crate::header::{ArrayData, ArrayType};
use crate::vanilla::VanillaArray;
use crate::value::TypedValue;

/// User-supplied element comparison.
pub type Comparator<'a> = &'a dyn Fn(&TypedValue, &TypedValue) -> Ordering;

/// The sort builtins.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SortFunction {
    /// Sort values, renumbering keys
    Sort,
    /// Reverse `Sort`
    RSort,
    /// `Sort` with a user comparator
    USort,
    /// Sort values, keeping keys
    ASort,
    /// Reverse `ASort`
    ARSort,
    /// Sort by key
    KSort,
    /// Reverse `KSort`
    KRSort,
    /// `ASort` with a user comparator
    UASort,
    /// `KSort` with a user comparator
    UKSort,
}

impl SortFunction {
    /// The functions that renumber keys, so the result always has the
    /// input's category.
    pub fn is_sort_family(self) -> bool {
        matches!(self, SortFunction::Sort | SortFunction::RSort | SortFunction::USort)
    }

    /// Returns true for descending orders.
    pub fn is_reverse(self) -> bool {
        matches!(
            self,
            SortFunction::RSort | SortFunction::ARSort | SortFunction::KRSort
        )
    }

    /// Returns true for orders on keys rather than values.
    pub fn is_key_sort(self) -> bool {
        matches!(
            self,
            SortFunction::KSort | SortFunction::KRSort | SortFunction::UKSort
        )
    }

    /// Returns true for the variants taking a user comparator.
    pub fn is_user(self) -> bool {
        matches!(
            self,
            SortFunction::USort | SortFunction::UASort | SortFunction::UKSort
        )
    }
}

/// Where a sort currently stands, for diagnostics.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SortPhase {
    /// Producing a vanilla snapshot
    Escalating,
    /// The generic routine runs on the snapshot
    CanonicalSorting,
    /// Deciding between the snapshot and a re-absorbed bespoke array
    Reconciling,
}

impl fmt::Display for SortPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SortPhase::Escalating => "escalating",
            SortPhase::CanonicalSorting => "sorting",
            SortPhase::Reconciling => "reconciling",
        })
    }
}

/// How a sort was carried out.
#[derive(Debug)]
pub enum SortOutcome {
    /// Sorted without a change of representation (vanilla input, or an empty
    /// array that needed no work)
    Handled(Array),
    /// The result is a vanilla array; the bespoke form was abandoned
    Escalated(Array),
    /// The sorted snapshot was re-absorbed into the input's layout
    Reconciled(Array),
}

impl SortOutcome {
    /// The sorted array.
    pub fn into_array(self) -> Array {
        match self {
            SortOutcome::Handled(a) | SortOutcome::Escalated(a) | SortOutcome::Reconciled(a) => a,
        }
    }

    /// The sorted array, by reference.
    pub fn array(&self) -> &Array {
        match self {
            SortOutcome::Handled(a) | SortOutcome::Escalated(a) | SortOutcome::Reconciled(a) => a,
        }
    }
}

/// Result of handing a sorted snapshot back to the dispatcher.
#[derive(Debug)]
pub enum PostSort {
    /// The snapshot's category differs from the input's; it is the result
    Escalated(NonNull<ArrayData>),
    /// The layout re-absorbed the snapshot
    Reconciled(NonNull<ArrayData>),
}

impl BespokeArray {
    /// Produces the vanilla array the generic sort routine will mutate.
    ///
    /// Key-preserving sorts of varrays and vecs cannot keep their category,
    /// so those escalate straight to a darray or dict. Everything else goes
    /// through the layout's pre-sort hook, which requires a non-empty array.
    ///
    /// # Safety
    /// `ad` must be a live bespoke array the caller holds a reference to.
    /// The returned snapshot is a new, uniquely owned reference.
    pub unsafe fn escalate_for_sort(ad: NonNull<ArrayData>, sf: SortFunction) -> NonNull<ArrayData> {
        let hd = ad.as_ref();
        let bad = Self::as_bespoke(hd);
        if !sf.is_sort_family() {
            let target = match hd.array_type() {
                ArrayType::VArray => Some("darray"),
                ArrayType::Vec => Some("dict"),
                _ => None,
            };
            if let Some(target) = target {
                let vad = Self::to_vanilla(hd, "escalate_for_sort");
                tracing::debug!(
                    target: "bespoke",
                    layout = bad.layout().name(),
                    sort = ?sf,
                    target,
                    "key-preserving sort escalated"
                );
                return VanillaArray::to_mixed(vad, false);
            }
        }
        always_assert!(!hd.is_empty(), "pre_sort called on empty bespoke array {:p}", hd);
        let vad = (bad.vtable().pre_sort)(ad, sf);
        let snapshot = vad.as_ref();
        always_assert!(
            snapshot.is_vanilla() && snapshot.has_exactly_one_ref(),
            "layout {} returned a shared or bespoke sort snapshot",
            bad.layout().name()
        );
        vad
    }

    /// Reconciles a sorted snapshot with the array it came from.
    ///
    /// # Safety
    /// `ad` must be the array passed to [`BespokeArray::escalate_for_sort`]
    /// and `vad` the snapshot it returned, now sorted. `vad` is consumed.
    /// As with other plain operations, a reconciled result that is not `ad`
    /// is a new reference and the caller keeps its reference to `ad`.
    pub unsafe fn post_sort(ad: NonNull<ArrayData>, vad: NonNull<ArrayData>) -> PostSort {
        let hd = ad.as_ref();
        let sorted = vad.as_ref();
        debug_assert!(sorted.is_vanilla());
        if hd.array_type() != sorted.array_type() {
            return PostSort::Escalated(vad);
        }
        always_assert!(
            sorted.has_exactly_one_ref(),
            "sorted snapshot {:p} is shared",
            sorted
        );
        let bad = Self::as_bespoke(hd);
        let index = bad.layout_index();
        let result = (bad.vtable().post_sort)(ad, vad);
        let reconciled = result.as_ref();
        always_assert!(
            !reconciled.is_vanilla()
                && BespokeArray::as_bespoke(reconciled).layout_index() == index,
            "layout {} did not re-absorb the sorted snapshot",
            bad.layout().name()
        );
        PostSort::Reconciled(result)
    }
}

impl Array {
    /// Sorts the array.
    ///
    /// Vanilla arrays sort in place (after copy-on-write). Bespoke arrays go
    /// through escalation and reconciliation. Empty arrays are returned
    /// untouched.
    pub fn sort(self, sf: SortFunction, cmp: Option<Comparator<'_>>) -> SortOutcome {
        if self.is_empty() {
            return SortOutcome::Handled(self);
        }
        if self.is_vanilla() {
            let array = if self.is_unique() {
                self
            } else {
                // Safety: the copy carries exactly one reference
                unsafe { Array::from_raw(VanillaArray::copy(self.header())) }
            };
            // Safety: uniquely owned vanilla array
            unsafe { VanillaArray::sort(array.as_ptr(), sf, cmp) };
            return SortOutcome::Handled(array);
        }

        let ad = self.as_ptr();
        tracing::trace!(target: "bespoke", phase = %SortPhase::Escalating, sort = ?sf);
        // Safety: we hold a reference to `ad` throughout
        let vad = unsafe { BespokeArray::escalate_for_sort(ad, sf) };
        tracing::trace!(target: "bespoke", phase = %SortPhase::CanonicalSorting, sort = ?sf);
        // Safety: the snapshot is a uniquely owned vanilla array
        unsafe { VanillaArray::sort(vad, sf, cmp) };
        tracing::trace!(target: "bespoke", phase = %SortPhase::Reconciling, sort = ?sf);
        // Safety: `vad` is the sorted snapshot of `ad`
        match unsafe { BespokeArray::post_sort(ad, vad) } {
            PostSort::Escalated(vad) => {
                drop(self);
                // Safety: the snapshot reference is handed to us
                SortOutcome::Escalated(unsafe { Array::from_raw(vad) })
            }
            PostSort::Reconciled(result) => {
                if result == ad {
                    SortOutcome::Reconciled(self)
                } else {
                    drop(self);
                    // Safety: a new reconciled array carries one reference
                    SortOutcome::Reconciled(unsafe { Array::from_raw(result) })
                }
            }
        }
    }
}
