//! A Size-Class groups all the Super-Blocks serving one Slot-Size

use crate::{
    descriptor::AnchorState,
    hazard, heap,
    list::DescriptorList,
    superblock::{MAX_SMALL_SIZE, SB_USABLE_SIZE},
};

/// The 10-bit `avail`/`count` Fields of the Anchor can not address more
/// Slots than this
const MAX_SLOT_COUNT: usize = (1 << 10) - 1;

/// The Number of non-empty Descriptors [`SizeClass::prune_empty`] observes
/// before giving up
///
/// This is a Throttle and not an Invariant, it only bounds how much Work a
/// single Free-Operation can pick up
const PRUNE_NONEMPTY_CUTOFF: usize = 2;

/// The Error returned when a [`SizeClass`] can not be built for a
/// requested Slot-Size
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum SizeClassError {
    /// The Slot-Size is smaller than the 4 Bytes needed to store the
    /// In-Block Free-List Link inside a free Slot
    TooSmall,
    /// The Slot-Size is not a Multiple of 4, so the Free-List Link inside
    /// a free Slot would not be naturally aligned
    Unaligned,
    /// The Slot-Size exceeds [`MAX_SMALL_SIZE`], such Allocations need to
    /// be served by a different Allocation-Path entirely
    TooLarge,
}

/// A collection of Super-Blocks that all serve the same Slot-Size
///
/// The Size-Class owns the shared List of partially filled Super-Blocks.
/// Multiple [`Heap`](crate::Heap)s may be bound to the same Size-Class and
/// will then exchange Super-Blocks through that List
pub struct SizeClass {
    slot_size: usize,
    max_count: usize,
    partial: DescriptorList,
}

impl SizeClass {
    /// Creates a new Size-Class for the given Slot-Size in Bytes
    ///
    /// # Example
    /// ```rust
    /// # use smallock::SizeClass;
    /// let size_class = SizeClass::new(64).unwrap();
    /// assert_eq!(64, size_class.slot_size());
    /// ```
    pub fn new(slot_size: usize) -> Result<Self, SizeClassError> {
        if slot_size < std::mem::size_of::<u32>() {
            return Err(SizeClassError::TooSmall);
        }
        if slot_size % std::mem::size_of::<u32>() != 0 {
            return Err(SizeClassError::Unaligned);
        }
        if slot_size > MAX_SMALL_SIZE {
            return Err(SizeClassError::TooLarge);
        }

        // Tiny Slot-Sizes would overflow the 10-bit Anchor-Fields, so the
        // Tail of the Super-Block stays unused for them
        let max_count = std::cmp::min(SB_USABLE_SIZE / slot_size, MAX_SLOT_COUNT);

        Ok(Self {
            slot_size,
            max_count,
            partial: DescriptorList::new(),
        })
    }

    /// The Slot-Size in Bytes served by this Size-Class
    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// The Number of Slots every Super-Block of this Size-Class is carved
    /// into
    pub fn max_count(&self) -> usize {
        self.max_count
    }

    pub(crate) fn partial(&self) -> &DescriptorList {
        &self.partial
    }

    /// Removes drained Descriptors that got stuck on the Partial-List
    ///
    /// A Freer that drains a Descriptor it could not take out of an
    /// Active-Slot has no way to remove that Descriptor from the List
    /// directly, so it pops a bounded Number of Descriptors instead,
    /// retires the drained ones and re-publishes the Rest. Without this,
    /// racing Frees could grow the List with empty Descriptors without
    /// bound
    pub(crate) fn prune_empty(&self) {
        let mut non_empty = 0;

        while non_empty < PRUNE_NONEMPTY_CUTOFF {
            let descriptor = match self.partial.try_pop() {
                Some(d) => d,
                None => return,
            };

            if unsafe { &*descriptor }.anchor().state == AnchorState::Empty {
                unsafe { heap::retire_descriptor(descriptor) };
            } else {
                non_empty += 1;
                hazard::retire(descriptor, heap::reclaim_into_partial);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_counts() {
        assert_eq!(255, SizeClass::new(64).unwrap().max_count());
        assert_eq!(1023, SizeClass::new(16).unwrap().max_count());

        // The largest served Slot-Size still gets two Slots per Block
        assert_eq!(2, SizeClass::new(MAX_SMALL_SIZE).unwrap().max_count());

        // Slots smaller than 16 Bytes are clamped by the 10-bit Fields
        assert_eq!(1023, SizeClass::new(4).unwrap().max_count());
        assert_eq!(1023, SizeClass::new(8).unwrap().max_count());
    }

    #[test]
    fn rejected_slot_sizes() {
        assert_eq!(Err(SizeClassError::TooSmall), SizeClass::new(0).map(|_| ()));
        assert_eq!(Err(SizeClassError::TooSmall), SizeClass::new(3).map(|_| ()));
        assert_eq!(
            Err(SizeClassError::Unaligned),
            SizeClass::new(10).map(|_| ())
        );
        assert_eq!(
            Err(SizeClassError::TooLarge),
            SizeClass::new(MAX_SMALL_SIZE + 4).map(|_| ())
        );
    }
}
