use std::sync::atomic;

use crate::descriptor::Descriptor;

/// A single Record in the global List of Hazard-Pointer-Records
///
/// Records are allocated once and never freed. When the owning Thread
/// exits, its Records are marked as inactive and can be claimed by a new
/// Thread, so the List can only ever grow to the maximum Number of
/// Threads that were alive at the same Time
pub struct Record {
    /// The Descriptor currently protected through this Record, a Null-Ptr
    /// while the Record does not protect anything
    pub ptr: atomic::AtomicPtr<Descriptor>,
    /// The Pointer to the next Record in the global List
    pub next: atomic::AtomicPtr<Record>,
    /// Whether some Thread currently owns this Record
    pub active: atomic::AtomicBool,
}

impl Record {
    /// Allocates a new Record that is already marked as owned by the
    /// calling Thread
    pub fn boxed_active() -> Box<Self> {
        Box::new(Self {
            ptr: atomic::AtomicPtr::new(std::ptr::null_mut()),
            next: atomic::AtomicPtr::new(std::ptr::null_mut()),
            active: atomic::AtomicBool::new(true),
        })
    }

    /// Attempts to take Ownership of an inactive Record, which a previous
    /// Thread has left behind on Exit
    pub fn try_claim(&self) -> bool {
        self.active
            .compare_exchange(
                false,
                true,
                atomic::Ordering::AcqRel,
                atomic::Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Clears the Protection published through this Record
    pub fn reset(&self) {
        self.ptr
            .store(std::ptr::null_mut(), atomic::Ordering::SeqCst);
    }

    /// Gives the Record up entirely, so another Thread can claim it
    pub fn release(&self) {
        self.reset();
        self.active.store(false, atomic::Ordering::Release);
    }
}
