//! Layout-polymorphic arrays for a reference-counted runtime.
//!
//! An array lives either in the canonical [`VanillaArray`] representation or
//! in one of any number of *bespoke* layouts. Bespoke arrays carry a layout
//! index in their [`ArrayData`] header; every operation on them is resolved
//! through the installed [`LayoutRegistry`] and forwarded to that layout's
//! [`LayoutFunctions`] table by the [`BespokeArray`] dispatcher. The generic
//! [`Array`] handle hides the difference.
//!
//! Arrays live in one of three domains:
//!
//! - counted: the normal case, mutated in place only when uniquely owned;
//! - uncounted: deep copies made for a cross-thread shared cache, see
//!   [`convert_to_shared`];
//! - static: immortal canonical arrays, see [`Array::into_static`].
//!
//! Call [`init`] once before creating any bespoke array.
#![deny(missing_docs)]

#[macro_use]
mod macros;

mod alloc;
mod array;
mod bespoke;
mod error;
mod header;
mod layout;
mod logging_array;
mod options;
mod sort;
mod uncounted;
mod value;
mod vanilla;

pub use alloc::{AllocError, SharedAllocator, SystemSharedAllocator, SHARED_ALIGN};
pub use array::{Array, Iter};
pub use bespoke::BespokeArray;
pub use error::BespokeError;
pub use header::{ArrayData, ArrayKind, ArrayType, LayoutIndex, RefCountMode, EXTRA_MAGIC_BIT};
pub use layout::{layouts, try_layouts, ConcreteLayout, LayoutFunctions, LayoutRegistry, Pos};
pub use logging_array::{
    ArrayOp, LoggingArray, LoggingEvent, LoggingProfile, Sampler, SrcKey, TransId,
};
pub use options::RuntimeOptions;
pub use sort::{Comparator, PostSort, SortFunction, SortOutcome, SortPhase};
pub use uncounted::{
    convert_to_shared, convert_to_shared_with, make_uncounted_array, release_uncounted_array,
    release_uncounted_value, to_uncounted_value, uncounted_alloc_extra, DedupMap, SeenMap,
    SharedArray, SharedCacheStats, UncountedHeap,
};
pub use value::{DataType, Key, TypedValue};
pub use vanilla::VanillaArray;

/// Installs `registry` as the process-wide layout registry and sets up the
/// shared-cache accounting requested by `options`.
///
/// Fails if a registry was already installed.
pub fn init(
    options: &RuntimeOptions,
    registry: LayoutRegistry,
) -> Result<&'static LayoutRegistry, BespokeError> {
    let layouts = registry.install()?;
    if options.track_shared_cache_stats {
        SharedCacheStats::create();
    }
    tracing::info!(
        target: "bespoke",
        layouts = layouts.len(),
        sample_rate = options.logging_sample_rate,
        shared_cache_stats = options.track_shared_cache_stats,
        "bespoke arrays initialized"
    );
    Ok(layouts)
}

#[cfg(test)]
#[global_allocator]
static ALLOCATOR: mockalloc::Mockalloc<std::alloc::System> = mockalloc::Mockalloc(std::alloc::System);

#[cfg(test)]
#[ctor::ctor]
fn install_test_layouts() {
    // Hash seeds are allocated once per process; do it outside any
    // allocation-checked test.
    let mut warm = hashbrown::HashMap::new();
    warm.insert(0u8, 0u8);
    drop(warm);
    init(&RuntimeOptions::default(), LayoutRegistry::new()).expect("registry installed twice");
}
