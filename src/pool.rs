//! The process-wide Pool of recycled Descriptor-Records
//!
//! Descriptors are allocated in Batches and live for the Rest of the
//! Process, the Pool only ever hands the same Records out again. Handing a
//! Record back always goes through the Hazard-Pointer Service, because
//! another Thread may still be about to CAS the Anchor of a Descriptor it
//! loaded from an Active-Slot or the Partial-List, and recycling the
//! Record under it would defeat the Tag

use crate::{
    descriptor::{AnchorState, Descriptor},
    hazard,
    list::DescriptorList,
    AllocError,
};

/// The Number of Descriptors allocated at once when the Pool runs dry
pub const NUM_DESC_BATCH: usize = 64;

/// The LIFO of free Descriptor-Records
static FREE: DescriptorList = DescriptorList::new();

/// Hands out a free Descriptor-Record, allocating a new Batch if the Pool
/// has run dry
pub fn acquire() -> Result<*mut Descriptor, AllocError> {
    if let Some(descriptor) = FREE.try_pop() {
        debug_assert!(!unsafe { &*descriptor }.is_in_use());
        return Ok(descriptor);
    }

    let layout = std::alloc::Layout::array::<Descriptor>(NUM_DESC_BATCH).unwrap();
    let batch = unsafe { std::alloc::alloc(layout) } as *mut Descriptor;
    if batch.is_null() {
        return Err(AllocError::OutOfMemory);
    }

    for index in 0..NUM_DESC_BATCH {
        unsafe { batch.add(index).write(Descriptor::blank()) };
    }

    // The first Record of the Batch goes straight to the Caller, the Rest
    // is linked up and spliced into the Pool with a single CAS, which also
    // publishes the Initialization-Writes above
    for index in 1..NUM_DESC_BATCH - 1 {
        unsafe { &*batch.add(index) }.next.store(
            unsafe { batch.add(index + 1) },
            std::sync::atomic::Ordering::Relaxed,
        );
    }
    unsafe { FREE.push_chain(batch.add(1), batch.add(NUM_DESC_BATCH - 1)) };

    log::debug!(
        "Allocated a new Batch of {} Descriptors at {:p}",
        NUM_DESC_BATCH,
        batch
    );

    Ok(batch)
}

/// Schedules a drained Descriptor for Reuse
///
/// The Record only re-enters the Pool once no Thread protects it anymore
pub fn release(descriptor: *mut Descriptor) {
    let desc = unsafe { &*descriptor };
    debug_assert!(!desc.is_in_use());
    debug_assert_eq!(AnchorState::Empty, desc.anchor().state);

    hazard::retire(descriptor, reclaim_into_pool);
}

/// Puts a Record back into the Pool immediately
///
/// # Safety
/// The Record must be provably unprotected, either because the
/// Hazard-Pointer Service just reclaimed it or because it was never
/// published anywhere
pub(crate) unsafe fn reclaim_into_pool(descriptor: *mut Descriptor) {
    unsafe { FREE.push(descriptor) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_returns_distinct_records() {
        let mut seen = Vec::new();

        // More than one Batch, so the Refill-Path runs at least once
        for _ in 0..(NUM_DESC_BATCH + 1) {
            let descriptor = acquire().unwrap();
            assert!(!descriptor.is_null());
            assert!(!seen.contains(&descriptor));

            seen.push(descriptor);
        }

        // Hand everything back through the regular Release-Path
        for descriptor in seen {
            release(descriptor);
        }
        crate::hazard::reclaim();
    }
}
