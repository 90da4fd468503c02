//! The object header shared by every array representation

use std::fmt::{self, Debug, Formatter};
use std::sync::atomic::{fence, AtomicU32, Ordering};

/// Bit of the 16-bit layout slot that marks an array as bespoke.
pub const EXTRA_MAGIC_BIT: u16 = 1 << 15;

/// Identifies one concrete bespoke layout in the layout registry.
///
/// The raw slot value is always below [`EXTRA_MAGIC_BIT`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LayoutIndex {
    raw: u16,
}

impl LayoutIndex {
    /// Largest index that can be stored next to the discriminator bit.
    pub const MAX: LayoutIndex = LayoutIndex {
        raw: EXTRA_MAGIC_BIT - 1,
    };

    /// Returns the index for `raw`, or `None` if it would collide with the
    /// discriminator bit.
    pub const fn new(raw: u16) -> Option<Self> {
        if raw <= Self::MAX.raw {
            Some(Self { raw })
        } else {
            None
        }
    }

    /// Index stored in a header's layout slot, discriminator bit dropped.
    pub(crate) const fn from_slot(slot: u16) -> Self {
        Self {
            raw: slot & !EXTRA_MAGIC_BIT,
        }
    }

    /// The raw slot value.
    pub const fn raw(self) -> u16 {
        self.raw
    }
}

impl fmt::Display for LayoutIndex {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.raw)
    }
}

const _: () = assert!(LayoutIndex::MAX.raw < EXTRA_MAGIC_BIT);

const BESPOKE_KIND_BIT: u8 = 0x08;

/// Physical array kind stored in the header.
///
/// Vanilla kinds have [`BESPOKE_KIND_BIT`] clear, bespoke kinds mirror them
/// with the bit set.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ArrayKind {
    /// Vanilla varray: sequential integer keys
    Packed = 0,
    /// Vanilla darray: arbitrary keys in insertion order
    Mixed = 1,
    /// Vanilla vec
    Vec = 2,
    /// Vanilla dict
    Dict = 3,
    /// Vanilla keyset
    Keyset = 4,
    /// Bespoke varray
    BespokeVArray = 8,
    /// Bespoke darray
    BespokeDArray = 9,
    /// Bespoke vec
    BespokeVec = 10,
    /// Bespoke dict
    BespokeDict = 11,
    /// Bespoke keyset
    BespokeKeyset = 12,
}

impl ArrayKind {
    /// Decodes a raw kind byte, returning `None` for unused values.
    pub fn from_raw(raw: u8) -> Option<Self> {
        use ArrayKind::*;
        Some(match raw {
            0 => Packed,
            1 => Mixed,
            2 => Vec,
            3 => Dict,
            4 => Keyset,
            8 => BespokeVArray,
            9 => BespokeDArray,
            10 => BespokeVec,
            11 => BespokeDict,
            12 => BespokeKeyset,
            _ => return None,
        })
    }

    /// Returns true for the canonical representations.
    pub fn is_vanilla(self) -> bool {
        (self as u8) & BESPOKE_KIND_BIT == 0
    }

    /// The user-visible category of arrays of this kind.
    pub fn array_type(self) -> ArrayType {
        use ArrayKind::*;
        match self {
            Packed | BespokeVArray => ArrayType::VArray,
            Mixed | BespokeDArray => ArrayType::DArray,
            Vec | BespokeVec => ArrayType::Vec,
            Dict | BespokeDict => ArrayType::Dict,
            Keyset | BespokeKeyset => ArrayType::Keyset,
        }
    }

    /// The vanilla kind used for arrays of category `ty`.
    pub fn vanilla(ty: ArrayType) -> Self {
        match ty {
            ArrayType::VArray => ArrayKind::Packed,
            ArrayType::DArray => ArrayKind::Mixed,
            ArrayType::Vec => ArrayKind::Vec,
            ArrayType::Dict => ArrayKind::Dict,
            ArrayType::Keyset => ArrayKind::Keyset,
        }
    }

    /// The bespoke kind used for arrays of category `ty`.
    pub fn bespoke(ty: ArrayType) -> Self {
        match ty {
            ArrayType::VArray => ArrayKind::BespokeVArray,
            ArrayType::DArray => ArrayKind::BespokeDArray,
            ArrayType::Vec => ArrayKind::BespokeVec,
            ArrayType::Dict => ArrayKind::BespokeDict,
            ArrayType::Keyset => ArrayKind::BespokeKeyset,
        }
    }
}

/// The dynamic element-type category of an array, independent of layout.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ArrayType {
    /// Legacy vector-like array
    VArray,
    /// Legacy dictionary-like array
    DArray,
    /// Hack vec
    Vec,
    /// Hack dict
    Dict,
    /// Hack keyset
    Keyset,
}

impl ArrayType {
    /// Returns true for the categories whose keys are always `0..len`.
    pub fn is_packed_shape(self) -> bool {
        matches!(self, ArrayType::VArray | ArrayType::Vec)
    }
}

/// The ownership domain of an array object.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum RefCountMode {
    /// Ordinary reference counting, copy-on-write when shared
    Counted = 0,
    /// Lives in the shared cache with an atomic refcount
    Uncounted = 1,
    /// Immortal
    Static = 2,
}

/// Header at the start of every array object.
///
/// Layout implementations embed this as the first field of a `#[repr(C)]`
/// struct so a pointer to the object is also a pointer to its header.
#[repr(C)]
pub struct ArrayData {
    count: AtomicU32,
    kind: u8,
    mode: RefCountMode,
    aux16: u16,
    extra_lo16: u16,
    extra_hi16: u16,
    size: u32,
}

impl ArrayData {
    /// Aux bit: the array is marked as a legacy array.
    pub const LEGACY_ARRAY: u16 = 1 << 0;
    /// Aux bit: an uncounted copy has a shared-cache entry slot in its prefix.
    pub const HAS_SHARED_ENTRY: u16 = 1 << 1;
    /// Aux bit: the array is wrapped by the sampling layout.
    pub const SAMPLED_ARRAY: u16 = 1 << 2;

    /// Creates a header with a reference count of one and an empty layout slot.
    pub fn new(kind: ArrayKind, mode: RefCountMode, aux16: u16) -> Self {
        Self {
            count: AtomicU32::new(1),
            kind: kind as u8,
            mode,
            aux16,
            extra_lo16: 0,
            extra_hi16: 0,
            size: 0,
        }
    }

    /// Rewrites the first eight bytes of the header (count, kind, mode and
    /// aux bits), leaving the layout slot and size untouched.
    pub fn init_header_16(&mut self, kind: ArrayKind, mode: RefCountMode, aux16: u16) {
        *self.count.get_mut() = 1;
        self.kind = kind as u8;
        self.mode = mode;
        self.aux16 = aux16;
    }

    /// The raw kind byte, valid or not.
    pub fn raw_kind(&self) -> u8 {
        self.kind
    }

    /// Returns true if the kind byte decodes to an [`ArrayKind`].
    pub fn kind_is_valid(&self) -> bool {
        ArrayKind::from_raw(self.kind).is_some()
    }

    /// The decoded kind. A corrupted kind byte is fatal.
    pub fn kind(&self) -> ArrayKind {
        match ArrayKind::from_raw(self.kind) {
            Some(kind) => kind,
            None => fatal!("array {:p} has invalid kind {:#x}", self, self.kind),
        }
    }

    pub(crate) fn set_kind(&mut self, kind: ArrayKind) {
        self.kind = kind as u8;
    }

    /// Returns true for arrays in a canonical representation.
    pub fn is_vanilla(&self) -> bool {
        self.kind & BESPOKE_KIND_BIT == 0
    }

    /// The user-visible category of the array.
    pub fn array_type(&self) -> ArrayType {
        self.kind().array_type()
    }

    /// Returns true for varrays and vecs, in any layout.
    pub fn is_packed_shape(&self) -> bool {
        self.array_type().is_packed_shape()
    }

    /// The ownership domain.
    pub fn mode(&self) -> RefCountMode {
        self.mode
    }

    /// Returns true for counted arrays.
    pub fn is_ref_counted(&self) -> bool {
        self.mode == RefCountMode::Counted
    }

    /// Returns true for arrays living in the shared cache.
    pub fn is_uncounted(&self) -> bool {
        self.mode == RefCountMode::Uncounted
    }

    /// Returns true for immortal arrays.
    pub fn is_static(&self) -> bool {
        self.mode == RefCountMode::Static
    }

    /// Current reference count in whichever domain the array lives in.
    pub fn ref_count(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    /// Returns true if the array is counted and uniquely owned, which is the
    /// only case in which it may be mutated in place.
    pub fn has_exactly_one_ref(&self) -> bool {
        self.is_ref_counted() && self.ref_count() == 1
    }

    /// Returns true if the array is counted and shared.
    pub fn has_multiple_refs(&self) -> bool {
        self.is_ref_counted() && self.ref_count() > 1
    }

    /// Takes a counted reference. Does nothing outside the counted domain.
    pub fn inc_ref_count(&self) {
        if self.is_ref_counted() {
            self.count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Drops a counted reference, returning true if it was the last one.
    /// Does nothing outside the counted domain.
    pub fn dec_ref_count(&self) -> bool {
        if !self.is_ref_counted() {
            return false;
        }
        let prev = self.count.fetch_sub(1, Ordering::Release);
        debug_assert!(prev > 0, "counted array {:p} over-released", self);
        if prev == 1 {
            fence(Ordering::Acquire);
            true
        } else {
            false
        }
    }

    /// Takes a reference to an uncounted array. Fails if the array is
    /// already being torn down.
    pub fn uncounted_inc_ref(&self) -> bool {
        debug_assert!(self.is_uncounted());
        let mut current = self.count.load(Ordering::Relaxed);
        loop {
            if current == 0 {
                return false;
            }
            match self.count.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Drops a reference to an uncounted array, returning true if it was the
    /// last one.
    pub fn uncounted_dec_ref(&self) -> bool {
        debug_assert!(self.is_uncounted());
        if self.count.fetch_sub(1, Ordering::Release) == 1 {
            fence(Ordering::Acquire);
            true
        } else {
            false
        }
    }

    /// Number of elements.
    pub fn size(&self) -> usize {
        self.size as usize
    }

    /// Returns true if the array has no elements.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Updates the element count.
    pub fn set_size(&mut self, size: usize) {
        assert!(size <= u32::MAX as usize, "Array size exceeds 32-bit limit");
        self.size = size as u32;
    }

    /// Raw aux bits.
    pub fn aux16(&self) -> u16 {
        self.aux16
    }

    fn set_aux_bit(&mut self, bit: u16, on: bool) {
        if on {
            self.aux16 |= bit;
        } else {
            self.aux16 &= !bit;
        }
    }

    /// Returns true if the array carries the legacy mark.
    pub fn is_legacy_array(&self) -> bool {
        self.aux16 & Self::LEGACY_ARRAY != 0
    }

    /// Sets or clears the legacy mark.
    pub fn set_legacy_flag(&mut self, legacy: bool) {
        self.set_aux_bit(Self::LEGACY_ARRAY, legacy);
    }

    /// Returns true if the array's prefix reserves a shared-cache entry slot.
    pub fn has_shared_entry(&self) -> bool {
        self.aux16 & Self::HAS_SHARED_ENTRY != 0
    }

    /// Returns true if the array is the vanilla array behind a sampling wrapper.
    pub fn is_sampled_array(&self) -> bool {
        self.aux16 & Self::SAMPLED_ARRAY != 0
    }

    /// Sets or clears the sampled mark.
    pub fn set_sampled_array(&mut self, sampled: bool) {
        self.set_aux_bit(Self::SAMPLED_ARRAY, sampled);
    }

    pub(crate) fn extra_hi16(&self) -> u16 {
        self.extra_hi16
    }

    pub(crate) fn set_extra_hi16(&mut self, value: u16) {
        self.extra_hi16 = value;
    }

    /// Layout-private 16 bits of the header.
    pub fn extra_lo16(&self) -> u16 {
        self.extra_lo16
    }

    /// Updates the layout-private 16 bits.
    pub fn set_extra_lo16(&mut self, value: u16) {
        self.extra_lo16 = value;
    }
}

impl Debug for ArrayData {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArrayData")
            .field("count", &self.ref_count())
            .field("kind", &ArrayKind::from_raw(self.kind))
            .field("mode", &self.mode)
            .field("aux16", &format_args!("{:#06x}", self.aux16))
            .field("extra_hi16", &format_args!("{:#06x}", self.extra_hi16))
            .field("size", &self.size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_sixteen_bytes() {
        assert_eq!(std::mem::size_of::<ArrayData>(), 16);
    }

    #[test]
    fn kinds_round_trip_through_raw() {
        for raw in 0..=u8::MAX {
            if let Some(kind) = ArrayKind::from_raw(raw) {
                assert_eq!(kind as u8, raw);
                assert_eq!(kind.is_vanilla(), raw & BESPOKE_KIND_BIT == 0);
            }
        }
        for ty in [
            ArrayType::VArray,
            ArrayType::DArray,
            ArrayType::Vec,
            ArrayType::Dict,
            ArrayType::Keyset,
        ] {
            assert!(ArrayKind::vanilla(ty).is_vanilla());
            assert!(!ArrayKind::bespoke(ty).is_vanilla());
            assert_eq!(ArrayKind::vanilla(ty).array_type(), ty);
            assert_eq!(ArrayKind::bespoke(ty).array_type(), ty);
        }
    }

    #[test]
    fn layout_index_rejects_magic_bit() {
        assert_eq!(LayoutIndex::new(0), Some(LayoutIndex { raw: 0 }));
        assert_eq!(LayoutIndex::new(EXTRA_MAGIC_BIT - 1), Some(LayoutIndex::MAX));
        assert_eq!(LayoutIndex::new(EXTRA_MAGIC_BIT), None);
        assert_eq!(LayoutIndex::new(u16::MAX), None);
        assert_eq!(LayoutIndex::from_slot(EXTRA_MAGIC_BIT | 3).raw(), 3);
        assert_eq!(LayoutIndex::from_slot(u16::MAX), LayoutIndex::MAX);
    }

    #[test]
    fn init_header_16_keeps_layout_slot_and_size() {
        let mut hd = ArrayData::new(ArrayKind::BespokeDict, RefCountMode::Counted, 0);
        hd.set_extra_hi16(EXTRA_MAGIC_BIT | 42);
        hd.set_size(7);
        hd.inc_ref_count();
        hd.init_header_16(
            ArrayKind::BespokeDict,
            RefCountMode::Uncounted,
            ArrayData::HAS_SHARED_ENTRY,
        );
        assert_eq!(hd.ref_count(), 1);
        assert!(hd.is_uncounted());
        assert!(hd.has_shared_entry());
        assert_eq!(hd.extra_hi16(), EXTRA_MAGIC_BIT | 42);
        assert_eq!(hd.size(), 7);
    }

    #[test]
    fn counted_refs() {
        let hd = ArrayData::new(ArrayKind::Vec, RefCountMode::Counted, 0);
        assert!(hd.has_exactly_one_ref());
        hd.inc_ref_count();
        assert!(hd.has_multiple_refs());
        assert!(!hd.dec_ref_count());
        assert!(hd.dec_ref_count());
    }

    #[test]
    fn static_refs_are_inert() {
        let hd = ArrayData::new(ArrayKind::Vec, RefCountMode::Static, 0);
        hd.inc_ref_count();
        assert_eq!(hd.ref_count(), 1);
        assert!(!hd.dec_ref_count());
        assert!(!hd.has_exactly_one_ref());
    }

    #[test]
    fn uncounted_inc_ref_fails_once_dead() {
        let hd = ArrayData::new(ArrayKind::Dict, RefCountMode::Uncounted, 0);
        assert!(hd.uncounted_inc_ref());
        assert!(!hd.uncounted_dec_ref());
        assert!(hd.uncounted_dec_ref());
        assert!(!hd.uncounted_inc_ref());
    }

    #[test]
    fn aux_bits() {
        let mut hd = ArrayData::new(ArrayKind::Dict, RefCountMode::Counted, 0);
        hd.set_legacy_flag(true);
        hd.set_sampled_array(true);
        assert!(hd.is_legacy_array());
        assert!(hd.is_sampled_array());
        assert!(!hd.has_shared_entry());
        hd.set_legacy_flag(false);
        assert!(!hd.is_legacy_array());
        assert!(hd.is_sampled_array());
    }

    #[test]
    #[should_panic(expected = "invalid kind")]
    fn corrupted_kind_is_fatal() {
        let mut hd = ArrayData::new(ArrayKind::Vec, RefCountMode::Counted, 0);
        hd.kind = 0x7f;
        assert!(!hd.kind_is_valid());
        hd.kind();
    }
}
