//! The Descriptor is the Control-Record for a single Super-Block
//!
//! All the mutable State of a Descriptor lives in its Anchor-Word, so that
//! both the Allocation- and the Free-Path can commit their changes with a
//! single Compare-and-Swap. The remaining Fields are only written while a
//! Thread holds the Descriptor privately, before it is published

use std::sync::atomic;

use crate::heap::Heap;

mod anchor;
mod anchor_state;

pub use anchor::{Anchor, TAG_MASK};
pub use anchor_state::AnchorState;

/// The Control-Record of one Super-Block
///
/// Descriptors are allocated in Batches that live for the Rest of the
/// Process, so a Descriptor is never freed, only recycled through the
/// global Pool once its Super-Block has been drained
pub struct Descriptor {
    /// The packed Anchor-Word, see [`Anchor`] for the Partitioning
    anchor: atomic::AtomicU64,
    /// The single Link-Word used for both the Partial-List of a Size-Class
    /// and the global Free-Pool, a Descriptor is only ever a Member of one
    /// of them at a Time
    pub next: atomic::AtomicPtr<Descriptor>,
    /// The Heap this Descriptor currently belongs to, updated when another
    /// Heap adopts the Descriptor from the shared Partial-List
    heap: atomic::AtomicPtr<Heap>,
    /// The Payload-Pointer of the owned Super-Block
    super_block: *mut u8,
    /// The Size of each Slot in the Super-Block in Bytes
    slot_size: usize,
    /// The Number of Slots the Super-Block was carved into
    max_count: usize,
    /// Debug-only Assertion-Aid, tracks whether the Descriptor is currently
    /// paired with a live Super-Block. Never used for Synchronization
    in_use: atomic::AtomicBool,
}

impl Descriptor {
    /// Creates the blank Descriptor that Pool-Batches are initialized with
    pub fn blank() -> Self {
        Self {
            anchor: atomic::AtomicU64::new(0),
            next: atomic::AtomicPtr::new(std::ptr::null_mut()),
            heap: atomic::AtomicPtr::new(std::ptr::null_mut()),
            super_block: std::ptr::null_mut(),
            slot_size: 0,
            max_count: 0,
            in_use: atomic::AtomicBool::new(false),
        }
    }

    /// Pairs the Descriptor with a freshly mapped Super-Block
    ///
    /// The Anchor is set up as if Slot 0 had just been handed out and the
    /// Tag continues from the previous Incarnation of this Descriptor,
    /// which keeps the Tag strictly monotonic even across Recycling
    ///
    /// # Safety
    /// The Caller must hold the Descriptor privately, i.e. it was just
    /// acquired from the Pool and has not been published yet
    pub unsafe fn reinit(
        this: *mut Self,
        heap: *mut Heap,
        super_block: *mut u8,
        slot_size: usize,
        max_count: usize,
    ) {
        let prev_tag = unsafe { &*this }.anchor().tag;
        let anchor = Anchor::initial(max_count as u32, prev_tag.wrapping_add(1) & TAG_MASK);

        // The plain Fields are written through the raw Pointer, because a
        // Thread that lost a Pop-Race on the Pool may still read the atomic
        // Fields of this Record concurrently
        unsafe {
            (*this).super_block = super_block;
            (*this).slot_size = slot_size;
            (*this).max_count = max_count;
            (*this).next.store(std::ptr::null_mut(), atomic::Ordering::Relaxed);
            (*this).heap.store(heap, atomic::Ordering::Release);
            (*this).in_use.store(true, atomic::Ordering::Relaxed);
            (*this)
                .anchor
                .store(anchor.into(), atomic::Ordering::Release);
        }
    }

    /// Loads the current unpacked Anchor
    pub fn anchor(&self) -> Anchor {
        self.anchor.load(atomic::Ordering::Acquire).into()
    }

    /// Attempts to replace the Anchor with a single CAS
    pub fn update_anchor(
        &self,
        old: Anchor,
        new: Anchor,
        success: atomic::Ordering,
        failure: atomic::Ordering,
    ) -> bool {
        self.anchor
            .compare_exchange(old.into(), new.into(), success, failure)
            .is_ok()
    }

    /// Overwrites the Anchor without a CAS
    ///
    /// # Safety
    /// Only allowed while the Descriptor is held privately, e.g. when a
    /// freshly built Super-Block lost the Active-Install Race and gets
    /// drained again before anyone else could see it
    pub unsafe fn store_anchor(&self, anchor: Anchor) {
        self.anchor.store(anchor.into(), atomic::Ordering::Release);
    }

    /// The Heap this Descriptor currently belongs to
    pub fn heap(&self) -> *mut Heap {
        self.heap.load(atomic::Ordering::Acquire)
    }

    /// Moves the Descriptor over to the Heap that adopted it from the
    /// shared Partial-List
    pub fn set_heap(&self, heap: *mut Heap) {
        self.heap.store(heap, atomic::Ordering::Release);
    }

    /// The Payload-Pointer of the owned Super-Block
    pub fn superblock_ptr(&self) -> *mut u8 {
        self.super_block
    }
    /// The Number of Slots in the Super-Block
    pub fn max_count(&self) -> usize {
        self.max_count
    }

    /// The Address of the Slot with the given Index
    pub fn slot_ptr(&self, index: u32) -> *mut u8 {
        self.super_block
            .wrapping_add(index as usize * self.slot_size)
    }

    /// Maps a Slot-Address back to its Index in the Super-Block
    ///
    /// # Panics
    /// A Pointer that is not Slot-aligned or outside the Super-Block is a
    /// Programming-Error of the Caller (e.g. a Free of a foreign Pointer)
    /// and aborts the Process
    pub fn slot_index(&self, ptr: *mut u8) -> u32 {
        let offset = (ptr as usize).wrapping_sub(self.super_block as usize);
        let index = offset / self.slot_size;

        assert!(
            offset % self.slot_size == 0 && index < self.max_count,
            "Pointer {:p} is not a Slot of the Super-Block at {:p}",
            ptr,
            self.super_block,
        );

        index as u32
    }

    /// Whether the given Pointer lies inside the Slot-Area of the owned
    /// Super-Block
    pub fn contains(&self, ptr: *mut u8) -> bool {
        let ptr_value = ptr as usize;
        let lower_bound = self.super_block as usize;
        let upper_bound = lower_bound + self.slot_size * self.max_count;

        lower_bound <= ptr_value && ptr_value < upper_bound
    }

    /// Reads the In-Block Free-List Link stored in the first Word of the
    /// given free Slot
    ///
    /// # Safety
    /// The Slot must currently be free, so that its first Word actually
    /// holds a Link and no User-Data
    pub unsafe fn next_free_slot(&self, index: u32) -> u32 {
        unsafe { (self.slot_ptr(index) as *const u32).read() }
    }

    /// Whether the Descriptor is currently paired with a live Super-Block
    pub fn is_in_use(&self) -> bool {
        self.in_use.load(atomic::Ordering::Relaxed)
    }
    /// Marks the Descriptor as unpaired again, right before Retirement
    pub fn set_in_use(&self, value: bool) {
        self.in_use.store(value, atomic::Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_descriptor(super_block: *mut u8, slot_size: usize, max_count: usize) -> Box<Descriptor> {
        let mut descriptor = Box::new(Descriptor::blank());
        let descriptor_ptr = descriptor.as_mut() as *mut Descriptor;

        unsafe {
            Descriptor::reinit(
                descriptor_ptr,
                std::ptr::null_mut(),
                super_block,
                slot_size,
                max_count,
            )
        };

        descriptor
    }

    #[test]
    fn reinit_continues_the_tag() {
        let mut descriptor = test_descriptor(0x4000 as *mut u8, 64, 255);

        let first = descriptor.anchor();
        assert_eq!(1, first.avail);
        assert_eq!(254, first.count);
        assert_eq!(AnchorState::Partial, first.state);
        assert_eq!(1, first.tag);

        let descriptor_ptr = descriptor.as_mut() as *mut Descriptor;
        unsafe {
            Descriptor::reinit(descriptor_ptr, std::ptr::null_mut(), 0x8000 as *mut u8, 64, 255)
        };

        assert_eq!(2, descriptor.anchor().tag);
    }

    #[test]
    fn update_anchor() {
        let descriptor = test_descriptor(0x4000 as *mut u8, 64, 255);

        let old = descriptor.anchor();
        let mut new = old;
        new.count -= 1;
        new.tag = old.next_tag();

        assert_eq!(
            true,
            descriptor.update_anchor(
                old,
                new,
                atomic::Ordering::AcqRel,
                atomic::Ordering::Acquire
            )
        );
        // A second Update based on the stale Anchor has to fail
        assert_eq!(
            false,
            descriptor.update_anchor(
                old,
                new,
                atomic::Ordering::AcqRel,
                atomic::Ordering::Acquire
            )
        );
    }

    #[test]
    fn contains() {
        let descriptor = test_descriptor(0x4000 as *mut u8, 64, 255);

        assert_eq!(true, descriptor.contains(0x4000 as *mut u8));
        assert_eq!(true, descriptor.contains((0x4000 + 17 * 64) as *mut u8));
        assert_eq!(true, descriptor.contains((0x4000 + 255 * 64 - 1) as *mut u8));

        // One past the last Slot and anything before the Payload is out
        assert_eq!(false, descriptor.contains((0x4000 + 255 * 64) as *mut u8));
        assert_eq!(false, descriptor.contains(0x3fff as *mut u8));
    }

    #[test]
    fn slot_index_roundtrip() {
        let descriptor = test_descriptor(0x4000 as *mut u8, 64, 255);

        for index in [0_u32, 1, 17, 254] {
            let ptr = descriptor.slot_ptr(index);
            assert_eq!(index, descriptor.slot_index(ptr));
        }
    }

    #[test]
    #[should_panic]
    fn slot_index_misaligned() {
        let descriptor = test_descriptor(0x4000 as *mut u8, 64, 255);

        descriptor.slot_index(0x4001 as *mut u8);
    }

    #[test]
    #[should_panic]
    fn slot_index_out_of_range() {
        let descriptor = test_descriptor(0x4000 as *mut u8, 64, 255);

        descriptor.slot_index((0x4000 + 255 * 64) as *mut u8);
    }
}
