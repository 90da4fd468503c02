#![allow(dead_code)]

pub mod int_vec;

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::Mutex;

use bespoke_array::{
    AllocError, Array, BespokeArray, LayoutRegistry, RuntimeOptions, SharedAllocator,
    SystemSharedAllocator,
};

#[ctor::ctor]
fn setup() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
    let mut registry = LayoutRegistry::new();
    int_vec::register(&mut registry);
    bespoke_array::init(&RuntimeOptions::default(), registry).expect("registry installed twice");
}

/// Panics unless a bespoke array passes its invariant check.
pub fn assert_invariants(array: &Array) {
    if array.is_bespoke() {
        assert!(BespokeArray::as_bespoke(array.header()).check_invariants());
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AllocEvent {
    Alloc { addr: usize, size: usize },
    Free { addr: usize, size: usize },
}

/// Shared allocator that records every call.
#[derive(Debug, Default)]
pub struct RecordingAllocator {
    events: Mutex<Vec<AllocEvent>>,
}

impl RecordingAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AllocEvent> {
        self.events.lock().expect("poisoned").clone()
    }

    pub fn allocations(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, AllocEvent::Alloc { .. }))
            .count()
    }

    /// Every allocation was freed exactly once, at the same address and
    /// with the same size.
    pub fn assert_balanced(&self) {
        let mut live = HashMap::new();
        for event in self.events() {
            match event {
                AllocEvent::Alloc { addr, size } => {
                    assert!(live.insert(addr, size).is_none(), "address {:#x} reused while live", addr);
                }
                AllocEvent::Free { addr, size } => {
                    assert_eq!(live.remove(&addr), Some(size), "free of {:#x} does not match", addr);
                }
            }
        }
        assert!(live.is_empty(), "leaked shared blocks: {:?}", live);
    }
}

impl SharedAllocator for RecordingAllocator {
    fn allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let ptr = SystemSharedAllocator.allocate(size)?;
        self.events.lock().expect("poisoned").push(AllocEvent::Alloc {
            addr: ptr.as_ptr() as usize,
            size,
        });
        Ok(ptr)
    }

    unsafe fn free(&self, ptr: NonNull<u8>, size: usize) {
        self.events.lock().expect("poisoned").push(AllocEvent::Free {
            addr: ptr.as_ptr() as usize,
            size,
        });
        SystemSharedAllocator.free(ptr, size)
    }
}
