//! Layout operation tables and the process-wide layout registry

use std::fmt::{self, Debug, Formatter};
use std::ptr::NonNull;
use std::sync::OnceLock;

use crate::array::Array;
use crate::error::BespokeError;
use crate::header::{ArrayData, LayoutIndex};
use crate::logging_array::LoggingArray;
use crate::sort::SortFunction;
use crate::uncounted::{DedupMap, UncountedHeap};
use crate::value::TypedValue;

/// Opaque iteration position. Each layout decides what it means; the only
/// guarantee is that positions are ordered between `iter_begin` and
/// `iter_end`.
pub type Pos = usize;

/// The operation table of one concrete layout.
///
/// Ownership conventions for the raw entries:
///
/// - Reads borrow the array.
/// - "Plain" mutations (`set_*`, `remove_*`, `append`, `pop`, the
///   conversions and `post_sort`) never consume the caller's reference. They
///   return either the input object, mutated in place because it was
///   uniquely owned, or a new object with a reference count of one.
/// - `*_move` mutations consume both the value and the caller's reference:
///   if a new object is returned, the input reference has been released.
/// - `escalate_to_vanilla` and `pre_sort` return a new reference to a
///   vanilla array.
pub struct LayoutFunctions {
    /// Bytes occupied by the object, used for raw copies.
    pub heap_size: fn(&ArrayData) -> usize,
    /// Frees a counted object whose reference count reached zero.
    pub release: unsafe fn(NonNull<ArrayData>),
    /// Returns true if the keys are exactly `0..size` in order.
    pub is_vector_data: fn(&ArrayData) -> bool,
    /// Value at an integer key, or `Uninit`.
    pub get_int: fn(&ArrayData, i64) -> TypedValue,
    /// Value at a string key, or `Uninit`.
    pub get_str: fn(&ArrayData, &str) -> TypedValue,
    /// Key at a valid position.
    pub get_pos_key: fn(&ArrayData, Pos) -> TypedValue,
    /// Value at a valid position.
    pub get_pos_val: fn(&ArrayData, Pos) -> TypedValue,
    /// Position of an integer key, or `iter_end`.
    pub get_int_pos: fn(&ArrayData, i64) -> Pos,
    /// Position of a string key, or `iter_end`.
    pub get_str_pos: fn(&ArrayData, &str) -> Pos,
    /// First position.
    pub iter_begin: fn(&ArrayData) -> Pos,
    /// Last valid position, or `iter_end` if empty.
    pub iter_last: fn(&ArrayData) -> Pos,
    /// The end sentinel.
    pub iter_end: fn(&ArrayData) -> Pos,
    /// Next position, saturating at `iter_end`.
    pub iter_advance: fn(&ArrayData, Pos) -> Pos,
    /// Previous position, `iter_end` before the first.
    pub iter_rewind: fn(&ArrayData, Pos) -> Pos,
    /// Mutable slot for an integer key, inserting null if missing. May
    /// replace the array (copy-on-write or escalation).
    pub lval_int: for<'a> fn(&'a mut Array, i64) -> &'a mut TypedValue,
    /// Mutable slot for a string key, inserting null if missing.
    pub lval_str: for<'a> fn(&'a mut Array, &str) -> &'a mut TypedValue,
    /// Mutable slot for an existing integer key.
    pub elem_int:
        for<'a> fn(&'a mut Array, i64, bool) -> Result<Option<&'a mut TypedValue>, BespokeError>,
    /// Mutable slot for an existing string key.
    pub elem_str:
        for<'a> fn(&'a mut Array, &str, bool) -> Result<Option<&'a mut TypedValue>, BespokeError>,
    /// Plain set at an integer key.
    pub set_int: unsafe fn(NonNull<ArrayData>, i64, &TypedValue) -> NonNull<ArrayData>,
    /// Plain set at a string key.
    pub set_str: unsafe fn(NonNull<ArrayData>, &str, &TypedValue) -> NonNull<ArrayData>,
    /// Consuming set at an integer key.
    pub set_int_move: unsafe fn(NonNull<ArrayData>, i64, TypedValue) -> NonNull<ArrayData>,
    /// Consuming set at a string key.
    pub set_str_move: unsafe fn(NonNull<ArrayData>, &str, TypedValue) -> NonNull<ArrayData>,
    /// Plain removal of an integer key.
    pub remove_int: unsafe fn(NonNull<ArrayData>, i64) -> NonNull<ArrayData>,
    /// Plain removal of a string key.
    pub remove_str: unsafe fn(NonNull<ArrayData>, &str) -> NonNull<ArrayData>,
    /// Uniquely owned vanilla snapshot to be sorted in place.
    pub pre_sort: unsafe fn(NonNull<ArrayData>, SortFunction) -> NonNull<ArrayData>,
    /// Re-absorbs a sorted snapshot of the same category, consuming it.
    pub post_sort: unsafe fn(NonNull<ArrayData>, NonNull<ArrayData>) -> NonNull<ArrayData>,
    /// Plain append.
    pub append: unsafe fn(NonNull<ArrayData>, &TypedValue) -> NonNull<ArrayData>,
    /// Plain pop; the removed value is written to the slot.
    pub pop: unsafe fn(NonNull<ArrayData>, &mut TypedValue) -> NonNull<ArrayData>,
    /// Conversion to the legacy categories.
    pub to_dv_array: unsafe fn(NonNull<ArrayData>, bool) -> NonNull<ArrayData>,
    /// Conversion to the hack categories.
    pub to_hack_arr: unsafe fn(NonNull<ArrayData>, bool) -> NonNull<ArrayData>,
    /// Sets or clears the legacy mark.
    pub set_legacy_array: unsafe fn(NonNull<ArrayData>, bool, bool) -> NonNull<ArrayData>,
    /// Copies the contents into a new vanilla array.
    pub escalate_to_vanilla: fn(&ArrayData, &'static str) -> NonNull<ArrayData>,
    /// Fixes up a freshly byte-copied uncounted object so that every nested
    /// reference it holds is itself uncounted.
    pub convert_to_uncounted:
        unsafe fn(NonNull<ArrayData>, &UncountedHeap<'_>, Option<&mut dyn DedupMap>),
    /// Tears down nested references of an uncounted object about to be freed.
    pub release_uncounted: unsafe fn(NonNull<ArrayData>, &UncountedHeap<'_>),
}

impl Debug for LayoutFunctions {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("LayoutFunctions").finish_non_exhaustive()
    }
}

/// A registered layout.
#[derive(Debug)]
pub struct ConcreteLayout {
    index: LayoutIndex,
    name: &'static str,
    vtable: &'static LayoutFunctions,
}

impl ConcreteLayout {
    /// The layout's index.
    pub fn index(&self) -> LayoutIndex {
        self.index
    }

    /// Human readable name, used in logs.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The operation table.
    pub fn vtable(&self) -> &'static LayoutFunctions {
        self.vtable
    }
}

/// Maps layout indices to operation tables. Populated before installation
/// and immutable afterwards.
#[derive(Debug)]
pub struct LayoutRegistry {
    layouts: Vec<ConcreteLayout>,
}

static LAYOUTS: OnceLock<LayoutRegistry> = OnceLock::new();

impl LayoutRegistry {
    /// Creates a registry holding the built-in sampling layout at index 0.
    pub fn new() -> Self {
        let mut registry = Self {
            layouts: Vec::new(),
        };
        registry.layouts.push(ConcreteLayout {
            index: LoggingArray::LAYOUT_INDEX,
            name: "LoggingArray",
            vtable: &LoggingArray::FUNCTIONS,
        });
        registry
    }

    /// Registers a layout under the next free index.
    pub fn register(
        &mut self,
        name: &'static str,
        vtable: &'static LayoutFunctions,
    ) -> Result<LayoutIndex, BespokeError> {
        let next = u16::try_from(self.layouts.len()).ok().and_then(LayoutIndex::new);
        let index = next.ok_or(BespokeError::RegistryFull(self.layouts.len()))?;
        tracing::debug!(target: "bespoke", %index, name, "registered layout");
        self.layouts.push(ConcreteLayout {
            index,
            name,
            vtable,
        });
        Ok(index)
    }

    /// Looks up a layout in constant time.
    pub fn resolve(&self, index: LayoutIndex) -> Option<&ConcreteLayout> {
        self.layouts.get(usize::from(index.raw()))
    }

    /// Number of registered layouts.
    pub fn len(&self) -> usize {
        self.layouts.len()
    }

    /// Always false: the sampling layout is registered on construction.
    pub fn is_empty(&self) -> bool {
        self.layouts.is_empty()
    }

    /// Iterates over the registered layouts in index order.
    pub fn iter(&self) -> impl Iterator<Item = &ConcreteLayout> {
        self.layouts.iter()
    }

    /// Makes this registry the process-wide one. Fails if one is already
    /// installed.
    pub fn install(self) -> Result<&'static LayoutRegistry, BespokeError> {
        let count = self.layouts.len();
        match LAYOUTS.set(self) {
            Ok(()) => {
                tracing::info!(target: "bespoke", layouts = count, "installed layout registry");
                Ok(layouts())
            }
            Err(_) => Err(BespokeError::RegistryInstalled),
        }
    }
}

impl Default for LayoutRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The installed registry. Using bespoke arrays before installation is fatal.
pub fn layouts() -> &'static LayoutRegistry {
    match LAYOUTS.get() {
        Some(registry) => registry,
        None => fatal!("bespoke layout registry used before installation"),
    }
}

/// The installed registry, if any.
pub fn try_layouts() -> Option<&'static LayoutRegistry> {
    LAYOUTS.get()
}
