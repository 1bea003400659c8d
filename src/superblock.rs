//! The Layout of a single Super-Block and the aligned OS-Memory Provider
//! backing it
//!
//! A Super-Block is a Chunk of `SB_SIZE` Bytes, aligned to `SB_SIZE`, whose
//! first Word stores a Pointer to the owning Descriptor. Thanks to the
//! Alignment, the Descriptor for any Address inside a Super-Block can be
//! recovered by simply masking off the lower Bits of the Address and reading
//! the Header, without any Lookup-Structure

use std::sync::atomic;

use crate::{descriptor::Descriptor, AllocError};

/// The Size of a single Super-Block in Bytes, which is also the Alignment
/// that every Super-Block is mapped with
pub const SB_SIZE: usize = 16384;

/// The Number of Bytes reserved at the Start of every Super-Block for the
/// Header, which stores the Pointer back to the owning Descriptor
pub const SB_HEADER_SIZE: usize = 16;

/// The Number of Bytes in a Super-Block that are actually available for
/// Slots
pub const SB_USABLE_SIZE: usize = SB_SIZE - SB_HEADER_SIZE;

/// The largest Slot-Size that this Allocator serves, larger Allocations
/// need to be handled by a different Allocation-Path entirely
pub const MAX_SMALL_SIZE: usize = 8184;

/// The Number of Super-Blocks currently mapped by the Allocator
static LIVE_SUPERBLOCKS: atomic::AtomicUsize = atomic::AtomicUsize::new(0);

/// The Number of Super-Blocks that are currently mapped and have not been
/// returned to the OS yet
///
/// # Note
/// This is a Diagnostic-Counter and is only exact while no other Thread is
/// allocating or freeing concurrently
pub fn live_superblocks() -> usize {
    LIVE_SUPERBLOCKS.load(atomic::Ordering::Relaxed)
}

fn layout() -> std::alloc::Layout {
    // SB_SIZE is a power of two, so this can never fail
    std::alloc::Layout::from_size_align(SB_SIZE, SB_SIZE).unwrap()
}

/// Maps a new Super-Block and returns the Pointer to its Payload, the first
/// Byte after the Header
pub fn allocate() -> Result<*mut u8, AllocError> {
    let base = unsafe { std::alloc::alloc(layout()) };
    if base.is_null() {
        return Err(AllocError::OutOfMemory);
    }

    let live = LIVE_SUPERBLOCKS.fetch_add(1, atomic::Ordering::Relaxed) + 1;
    log::debug!("Mapped a new Super-Block at {:p} ({} live)", base, live);

    Ok(unsafe { base.add(SB_HEADER_SIZE) })
}

/// Returns the Super-Block with the given Payload-Pointer to the OS
///
/// # Safety
/// The Pointer must have been returned by [`allocate`] and the Super-Block
/// must not be touched again afterwards
pub unsafe fn release(payload: *mut u8) {
    let base = unsafe { payload.sub(SB_HEADER_SIZE) };

    let live = LIVE_SUPERBLOCKS.fetch_sub(1, atomic::Ordering::Relaxed) - 1;
    log::debug!("Unmapped the Super-Block at {:p} ({} live)", base, live);

    unsafe { std::alloc::dealloc(base, layout()) };
}

/// Stores the owning Descriptor in the Header of the Super-Block
///
/// This has to happen while the Super-Block is still privately owned,
/// before the Descriptor is published through an Active-Slot or the
/// Partial-List, as the publishing CAS is what makes the Header visible to
/// other Threads
///
/// # Safety
/// The Payload-Pointer must have been returned by [`allocate`]
pub unsafe fn set_descriptor(payload: *mut u8, descriptor: *mut Descriptor) {
    let base = unsafe { payload.sub(SB_HEADER_SIZE) };
    unsafe { (base as *mut *mut Descriptor).write(descriptor) };
}

/// Recovers the owning Descriptor for any Address inside a Super-Block
///
/// This is the only Mechanism the Free-Path has to identify the Ownership
/// of a Pointer and is a single masked Read, O(1) and Pointer-only
///
/// # Safety
/// The Address must point into the Payload of a live Super-Block
pub unsafe fn descriptor_for_addr(addr: *mut u8) -> *mut Descriptor {
    let base = (addr as usize) & !(SB_SIZE - 1);
    unsafe { (base as *const *mut Descriptor).read() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_release() {
        let payload = allocate().unwrap();

        // The Payload starts right after the Header and the Block itself is
        // aligned to SB_SIZE. The Live-Counter includes at least our Block,
        // exact Counts are asserted in the serialized Integration-Tests
        assert_eq!(SB_HEADER_SIZE, (payload as usize) % SB_SIZE);
        assert!(live_superblocks() >= 1);

        unsafe { release(payload) };
    }

    #[test]
    fn descriptor_roundtrip() {
        let payload = allocate().unwrap();
        let descriptor = 0x123 as *mut Descriptor;

        unsafe { set_descriptor(payload, descriptor) };

        // Any Address inside the Block maps back to the same Descriptor
        assert_eq!(descriptor, unsafe { descriptor_for_addr(payload) });
        assert_eq!(descriptor, unsafe {
            descriptor_for_addr(payload.wrapping_add(SB_USABLE_SIZE - 1))
        });

        unsafe { release(payload) };
    }
}
