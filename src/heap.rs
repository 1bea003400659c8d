//! The Allocation- and Free-Path of the Allocator
//!
//! A Heap is the user facing Allocation-Endpoint for one Size-Class. The
//! Allocation-Path tries the cached active Descriptor first, then the
//! shared Partial-List of the Size-Class and only builds a completely new
//! Super-Block when both came up empty. The Free-Path finds the owning
//! Descriptor through the Super-Block Header and drives it back towards
//! the Active-Slot, the Partial-List or Retirement.
//!
//! Both Paths commit every State-Change with a single CAS on the Anchor of
//! the affected Descriptor, so neither of them ever blocks. Under
//! Contention an individual Operation may retry, but some Thread always
//! makes Progress

use std::{ptr::NonNull, sync::atomic};

use crate::{
    descriptor::{Anchor, AnchorState, Descriptor},
    hazard, pool,
    size_class::SizeClass,
    superblock, AllocError,
};

/// A user facing Allocation-Endpoint bound to one Size-Class
///
/// The Heap caches a single "active" Descriptor that Allocations are
/// preferably served from. The Active-Slot is handed between Threads with
/// an atomic Swap, so only one Thread at a Time runs the Allocation-Step
/// on a given Descriptor and two Allocators never contend on the same
/// Super-Block.
///
/// All Methods take `&self` and are safe to call from any Number of
/// Threads at once
pub struct Heap {
    size_class: &'static SizeClass,
    /// The Descriptor currently privileged for Allocations, a Null-Ptr if
    /// no Thread has published one
    active: atomic::AtomicPtr<Descriptor>,
}

impl Heap {
    /// Binds a new Heap to the given Size-Class
    ///
    /// Multiple Heaps may share one Size-Class and will then exchange
    /// their partially filled Super-Blocks through it
    pub fn new(size_class: &'static SizeClass) -> Self {
        Self {
            size_class,
            active: atomic::AtomicPtr::new(std::ptr::null_mut()),
        }
    }

    /// The Size-Class this Heap serves
    pub fn size_class(&self) -> &'static SizeClass {
        self.size_class
    }

    /// Hands out one Slot of the Heaps Slot-Size
    ///
    /// The returned Memory is uninitialized and stays valid until it is
    /// passed to [`deallocate`]. The Operation only fails when the OS
    /// refuses to map more Memory, all internal Contention is retried
    /// without ever blocking
    pub fn allocate(&self) -> Result<NonNull<u8>, AllocError> {
        loop {
            if let Some(ptr) = self.alloc_from_active() {
                return Ok(ptr);
            }
            if let Some(ptr) = self.alloc_from_partial() {
                return Ok(ptr);
            }
            if let Some(ptr) = self.alloc_from_new_sb()? {
                return Ok(ptr);
            }
        }
    }

    /// Takes the active Descriptor out of its Slot and allocates from it
    fn alloc_from_active(&self) -> Option<NonNull<u8>> {
        let descriptor = self
            .active
            .swap(std::ptr::null_mut(), atomic::Ordering::SeqCst);
        if descriptor.is_null() {
            return None;
        }

        unsafe { self.alloc_from_desc(descriptor) }
    }

    /// Adopts a Descriptor from the shared Partial-List of the Size-Class
    fn alloc_from_partial(&self) -> Option<NonNull<u8>> {
        loop {
            let descriptor = self.size_class.partial().try_pop()?;

            // The Descriptor may have been built by a different Heap of
            // this Size-Class, from now on it belongs to us
            unsafe { &*descriptor }.set_heap(self as *const Heap as *mut Heap);

            if let Some(ptr) = unsafe { self.alloc_from_desc(descriptor) } {
                return Some(ptr);
            }
            // The popped Descriptor was drained by a racing Freer and has
            // been retired, try the next one
        }
    }

    /// The Allocation-Step on a privately held Descriptor
    ///
    /// Returns None if the Descriptor turned out to be drained, in which
    /// case it has already been retired and the Caller restarts
    ///
    /// # Safety
    /// The Caller must hold the Descriptor privately, i.e. it was just
    /// swapped out of an Active-Slot or popped off the Partial-List
    unsafe fn alloc_from_desc(&self, descriptor_ptr: *mut Descriptor) -> Option<NonNull<u8>> {
        let descriptor = unsafe { &*descriptor_ptr };

        loop {
            let old = descriptor.anchor();

            if old.state == AnchorState::Empty {
                // A racing Freer returned the last Slot before we got
                // here, the Super-Block is already on its Way out
                unsafe { retire_descriptor(descriptor_ptr) };
                return None;
            }
            // A Full Descriptor is never active and never on the
            // Partial-List, so privately held means Partial here
            debug_assert_eq!(AnchorState::Partial, old.state);

            // The Acquire on the Anchor-Load orders this Read after the
            // Write of the Link by whoever freed the Slot
            let next = unsafe { descriptor.next_free_slot(old.avail) };

            let mut new = old;
            new.avail = next;
            new.count = old.count - 1;
            new.state = if new.count == 0 {
                AnchorState::Full
            } else {
                AnchorState::Partial
            };
            new.tag = old.next_tag();

            if descriptor.update_anchor(
                old,
                new,
                atomic::Ordering::AcqRel,
                atomic::Ordering::Acquire,
            ) {
                let slot = descriptor.slot_ptr(old.avail);

                if new.state == AnchorState::Partial {
                    // Still has free Slots, make it findable again. A Full
                    // Descriptor is left unowned instead, the Free that
                    // makes it Partial again re-publishes it
                    self.republish(descriptor_ptr);
                }

                return Some(unsafe { NonNull::new_unchecked(slot) });
            }
        }
    }

    /// Makes a privately held, still usable Descriptor findable for other
    /// Threads again
    fn republish(&self, descriptor_ptr: *mut Descriptor) {
        if self
            .active
            .compare_exchange(
                std::ptr::null_mut(),
                descriptor_ptr,
                atomic::Ordering::SeqCst,
                atomic::Ordering::SeqCst,
            )
            .is_err()
        {
            // Another Thread installed its own Descriptor in the mean
            // time, hand ours to the Partial-List instead. The Push is
            // deferred until no Thread can still hold a Reference from an
            // earlier Pop
            hazard::retire(descriptor_ptr, reclaim_into_partial);
        }
    }

    /// Builds a new Super-Block and tries to install it as active
    ///
    /// Returns `Ok(None)` if another Thread was faster with its own new
    /// Super-Block, in which case ours is drained again and the Caller
    /// retries the whole Allocation
    fn alloc_from_new_sb(&self) -> Result<Option<NonNull<u8>>, AllocError> {
        let descriptor_ptr = pool::acquire()?;

        let super_block = match superblock::allocate() {
            Ok(sb) => sb,
            Err(error) => {
                pool::release(descriptor_ptr);
                return Err(error);
            }
        };

        let slot_size = self.size_class.slot_size();
        let max_count = self.size_class.max_count();

        unsafe {
            Descriptor::reinit(
                descriptor_ptr,
                self as *const Heap as *mut Heap,
                super_block,
                slot_size,
                max_count,
            );
            superblock::set_descriptor(super_block, descriptor_ptr);
        }
        let descriptor = unsafe { &*descriptor_ptr };

        // Carve the In-Block Free-List. Slot 0 is handed to the Caller, so
        // the Chain starts at 1. The terminal Link gets an explicit
        // out-of-range Sentinel, `avail` can never reach it before a Free
        // rewrites it, but nothing should depend on that Subtlety
        for index in 1..max_count {
            let next = (index + 1) as u32;
            unsafe { (descriptor.slot_ptr(index as u32) as *mut u32).write(next) };
        }

        let first_slot = unsafe { NonNull::new_unchecked(descriptor.slot_ptr(0)) };

        if max_count == 1 {
            // The single Slot is already handed out, the Block starts out
            // Full and stays unowned like any other Full Descriptor
            return Ok(Some(first_slot));
        }

        if self
            .active
            .compare_exchange(
                std::ptr::null_mut(),
                descriptor_ptr,
                atomic::Ordering::SeqCst,
                atomic::Ordering::SeqCst,
            )
            .is_ok()
        {
            return Ok(Some(first_slot));
        }

        // Lost the Install-Race against another Thread, drain the never
        // published Block again
        unsafe {
            descriptor.store_anchor(Anchor::drained(
                max_count as u32,
                descriptor.anchor().next_tag(),
            ));
            retire_descriptor(descriptor_ptr);
        }

        Ok(None)
    }

    /// Walks the active Descriptor and the Partial-List of the Size-Class
    /// and verifies every Invariant the Allocator relies on
    ///
    /// The Walk itself is read-only and leaves the List-Contents
    /// untouched. The Result is only exact while no other Thread is
    /// allocating or freeing concurrently, so this is a Diagnostic-Tool
    /// for quiescent Moments, e.g. after a Test drained its Allocations
    pub fn check_consistency(&self) -> Result<ConsistencyReport, ConsistencyError> {
        let mut report = ConsistencyReport::default();

        let active = self.active.load(atomic::Ordering::SeqCst);
        if !active.is_null() {
            report.active = true;
            verify_descriptor(unsafe { &*active }, &mut report)?;
        }

        for descriptor in self.size_class.partial().iter() {
            report.partial_descriptors += 1;
            verify_descriptor(unsafe { &*descriptor }, &mut report)?;
        }

        Ok(report)
    }
}

/// The Summary produced by a successful [`Heap::check_consistency`] Walk
#[derive(Debug, PartialEq, Default, Clone, Copy)]
pub struct ConsistencyReport {
    /// Whether the Heap currently has an active Descriptor published
    pub active: bool,
    /// The Number of Descriptors found on the Partial-List of the
    /// Size-Class
    pub partial_descriptors: usize,
    /// The total Number of free Slots across all walked Descriptors
    pub free_slots: usize,
}

/// A broken Invariant found by [`Heap::check_consistency`]
///
/// Any of these indicates Memory-Corruption or a Bug in the Allocator
/// itself, they are never the Result of normal Contention
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum ConsistencyError {
    /// The Fill-State of a Descriptor does not match its Free-Slot Count
    StateMismatch {
        /// The Number of free Slots the Anchor claims
        count: u32,
        /// The Number of Slots of the Super-Block
        max_count: u32,
    },
    /// The In-Block Free-List referenced a Slot-Index outside the
    /// Super-Block
    SlotOutOfRange {
        /// The offending Index
        index: u32,
        /// The Number of Slots of the Super-Block
        max_count: u32,
    },
    /// The In-Block Free-List visited the same Slot twice, it has to be a
    /// simple Chain
    SlotRevisited {
        /// The Index that was reached a second Time
        index: u32,
    },
}

fn verify_descriptor(
    descriptor: &Descriptor,
    report: &mut ConsistencyReport,
) -> Result<(), ConsistencyError> {
    let anchor = descriptor.anchor();
    let max_count = descriptor.max_count() as u32;

    let expected_state = match anchor.count {
        0 => AnchorState::Full,
        count if count == max_count => AnchorState::Empty,
        _ => AnchorState::Partial,
    };
    if anchor.state != expected_state {
        log::error!(
            "Descriptor {:p}: State {:?} does not match Count {}/{}",
            descriptor,
            anchor.state,
            anchor.count,
            max_count
        );
        return Err(ConsistencyError::StateMismatch {
            count: anchor.count,
            max_count,
        });
    }

    // The Free-List has to be a simple Chain of exactly `count` distinct
    // in-range Indices
    let mut seen = vec![false; max_count as usize];
    let mut index = anchor.avail;
    for _ in 0..anchor.count {
        if index >= max_count {
            log::error!(
                "Descriptor {:p}: Free-List left the Super-Block at Index {}",
                descriptor,
                index
            );
            return Err(ConsistencyError::SlotOutOfRange { index, max_count });
        }
        if seen[index as usize] {
            log::error!(
                "Descriptor {:p}: Free-List visited Index {} twice",
                descriptor,
                index
            );
            return Err(ConsistencyError::SlotRevisited { index });
        }

        seen[index as usize] = true;
        index = unsafe { descriptor.next_free_slot(index) };
    }

    report.free_slots += anchor.count as usize;
    Ok(())
}

/// Returns a previously allocated Slot to its owning Super-Block
///
/// # Safety
/// The Pointer must have been returned by [`Heap::allocate`] and not been
/// freed since. The Slot must not be touched anymore once it was handed
/// back, it can be reused by another Thread immediately
pub unsafe fn deallocate(ptr: *mut u8) {
    let descriptor_ptr = unsafe { superblock::descriptor_for_addr(ptr) };
    let descriptor = unsafe { &*descriptor_ptr };

    // The Super-Block can not drain while the Slot being freed is still
    // outstanding, so the Descriptor is guaranteed live here. Pinning it
    // keeps it from being recycled between our Anchor-CAS and the
    // Hand-Off CASes below, a Window in which a recycled Descriptor could
    // otherwise be mistaken for the one we drained
    let _pin = hazard::pin(descriptor_ptr);

    debug_assert!(descriptor.contains(ptr));
    let slot = descriptor.slot_index(ptr);
    let max_count = descriptor.max_count() as u32;

    let mut old;
    let mut new;
    loop {
        old = descriptor.anchor();

        // A Free into a Block without outstanding Slots can only be a
        // Double-Free
        assert!(
            old.count < max_count,
            "Free of {:p}, but its Super-Block has no outstanding Slots",
            ptr
        );

        // Push the Slot onto the In-Block Free-List. A failed CAS repeats
        // this Write with the fresh List-Head
        unsafe { (ptr as *mut u32).write(old.avail) };

        new = old;
        new.avail = slot;
        new.count = old.count + 1;
        new.state = if new.count == max_count {
            AnchorState::Empty
        } else {
            // Covers both Full -> Partial and Partial -> Partial
            AnchorState::Partial
        };
        new.tag = old.next_tag();

        if descriptor.update_anchor(
            old,
            new,
            atomic::Ordering::AcqRel,
            atomic::Ordering::Acquire,
        ) {
            break;
        }
    }

    if new.state == AnchorState::Empty {
        unsafe { handle_drained(descriptor_ptr, old.state) };
    } else if old.state == AnchorState::Full {
        // The Block just left Full, re-publish it so Allocations can find
        // it again
        let heap = unsafe { &*descriptor.heap() };
        if heap
            .active
            .compare_exchange(
                std::ptr::null_mut(),
                descriptor_ptr,
                atomic::Ordering::SeqCst,
                atomic::Ordering::SeqCst,
            )
            .is_err()
        {
            hazard::retire(descriptor_ptr, reclaim_into_partial);
        }
    }
}

/// Decides who retires a Descriptor that was just drained by [`deallocate`]
unsafe fn handle_drained(descriptor_ptr: *mut Descriptor, previous: AnchorState) {
    let descriptor = unsafe { &*descriptor_ptr };
    let heap = unsafe { &*descriptor.heap() };
    let size_class = heap.size_class;

    if previous == AnchorState::Full {
        // A Full Descriptor is not in any List and not in an Active-Slot,
        // so the draining Freer owns it outright
        unsafe { retire_descriptor(descriptor_ptr) };
    } else if heap
        .active
        .compare_exchange(
            descriptor_ptr,
            std::ptr::null_mut(),
            atomic::Ordering::SeqCst,
            atomic::Ordering::SeqCst,
        )
        .is_ok()
    {
        // Taking it out of the Active-Slot made us its sole Owner
        unsafe { retire_descriptor(descriptor_ptr) };
    }
    // Otherwise the Descriptor sits on the Partial-List or is privately
    // held by an Allocator that will notice the Drain on its own

    // Racing Frees and Hand-Offs can strand drained Descriptors on the
    // Partial-List, sweep a bounded Number of them while we are here
    size_class.prune_empty();
}

/// Releases the Super-Block of a drained Descriptor and schedules the
/// Record itself for Reuse
///
/// # Safety
/// The Caller must be the sole Owner of the Descriptor, i.e. it removed it
/// from the shared Structures itself or observed the Drain while holding
/// it privately
pub(crate) unsafe fn retire_descriptor(descriptor_ptr: *mut Descriptor) {
    let descriptor = unsafe { &*descriptor_ptr };
    debug_assert_eq!(AnchorState::Empty, descriptor.anchor().state);

    descriptor.set_in_use(false);
    unsafe { superblock::release(descriptor.superblock_ptr()) };

    pool::release(descriptor_ptr);
}

/// The Reclaim-Target for deferred Partial-List Pushes, only ever invoked
/// by the Hazard-Pointer Service once the Descriptor is provably
/// unprotected
pub(crate) unsafe fn reclaim_into_partial(descriptor_ptr: *mut Descriptor) {
    let descriptor = unsafe { &*descriptor_ptr };

    if descriptor.anchor().state == AnchorState::Empty {
        // Drained while it was parked in a Retired-List. No Protection nor
        // any shared Structure references it anymore, so it can skip the
        // List and go straight back to the Pool
        descriptor.set_in_use(false);
        unsafe {
            superblock::release(descriptor.superblock_ptr());
            pool::reclaim_into_pool(descriptor_ptr);
        }
        return;
    }

    let heap = unsafe { &*descriptor.heap() };
    unsafe { heap.size_class.partial().push(descriptor_ptr) };
}
