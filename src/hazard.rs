//! The Hazard-Pointer Service that makes Descriptor-Recycling safe
//!
//! A Descriptor that was popped off a List may still be examined by other
//! Threads that lost the Pop-Race, so it must not be reused or re-published
//! until all of those References have drained. Every Thread publishes the
//! Descriptors it is currently examining through Hazard-Records in a global
//! List and retired Descriptors are only reclaimed once no Record protects
//! them anymore.
//!
//! The Tag inside the Anchor alone would not be enough, because the Storage
//! of the Descriptor-Record itself could be recycled mid-CAS.
//!
//! # Reference:
//! * [Hazard Pointers: Safe Memory Reclamation for Lock-Free Objects](https://www.eecg.utoronto.ca/~amza/ece1747h/papers/hazard_pointers.pdf)

use std::{cell::RefCell, collections::HashSet, sync::atomic};

use crate::descriptor::Descriptor;

mod guard;
mod record;

pub use guard::Guard;
use record::Record;

/// The Number of retired Descriptors a Thread queues up before it attempts
/// a Reclamation-Scan
const RETIRE_THRESHOLD: usize = 64;

/// The global List of all Hazard-Records, only ever grows
static RECORDS: atomic::AtomicPtr<Record> = atomic::AtomicPtr::new(std::ptr::null_mut());

/// Retired Descriptors that were left behind by exited Threads and wait
/// for some live Thread to adopt them
static ORPHANS: atomic::AtomicPtr<OrphanNode> = atomic::AtomicPtr::new(std::ptr::null_mut());

/// A retired Descriptor together with the Function that will re-publish or
/// recycle it once no Thread protects it anymore
#[derive(Clone, Copy)]
struct RetireNode {
    ptr: *mut Descriptor,
    reclaim: unsafe fn(*mut Descriptor),
}

struct OrphanNode {
    node: RetireNode,
    next: *mut OrphanNode,
}

fn spill_orphan(node: RetireNode) {
    let orphan = Box::into_raw(Box::new(OrphanNode {
        node,
        next: std::ptr::null_mut(),
    }));

    loop {
        let head = ORPHANS.load(atomic::Ordering::SeqCst);
        unsafe { (*orphan).next = head };

        if ORPHANS
            .compare_exchange(
                head,
                orphan,
                atomic::Ordering::SeqCst,
                atomic::Ordering::SeqCst,
            )
            .is_ok()
        {
            return;
        }
    }
}

/// The Thread-Local Side of the Hazard-Pointer Service
struct Domain {
    /// The Hazard-Records this Thread currently owns
    records: Vec<*mut Record>,
    /// The Descriptors this Thread has retired that could not be reclaimed
    /// yet
    retired: Vec<RetireNode>,
}

thread_local! {
    static DOMAIN: RefCell<Domain> = RefCell::new(Domain::new());
}

impl Domain {
    fn new() -> Self {
        Self {
            records: Vec::new(),
            retired: Vec::new(),
        }
    }

    /// Finds an owned Record that does not protect anything right now,
    /// claiming or allocating a new one if every owned Record is busy
    fn idle_record(&mut self) -> *mut Record {
        for &record in self.records.iter() {
            if unsafe { &*record }
                .ptr
                .load(atomic::Ordering::Relaxed)
                .is_null()
            {
                return record;
            }
        }

        let record = Self::claim_or_append();
        self.records.push(record);
        record
    }

    /// Claims an inactive Record from the global List or appends a newly
    /// allocated one at the Front
    fn claim_or_append() -> *mut Record {
        let mut current = RECORDS.load(atomic::Ordering::SeqCst);
        while !current.is_null() {
            let record = unsafe { &*current };
            if !record.active.load(atomic::Ordering::Relaxed) && record.try_claim() {
                return current;
            }

            current = record.next.load(atomic::Ordering::SeqCst);
        }

        let record_ptr = Box::into_raw(Record::boxed_active());
        loop {
            let head = RECORDS.load(atomic::Ordering::SeqCst);
            unsafe { &*record_ptr }
                .next
                .store(head, atomic::Ordering::SeqCst);

            if RECORDS
                .compare_exchange(
                    head,
                    record_ptr,
                    atomic::Ordering::SeqCst,
                    atomic::Ordering::SeqCst,
                )
                .is_ok()
            {
                return record_ptr;
            }
        }
    }

    /// Publishes a Protection for a Descriptor the Caller already knows
    /// to be live, without the Re-Validation-Loop of
    /// [`protect`](Domain::protect)
    fn pin(&mut self, ptr: *mut Descriptor) -> Guard {
        let record_ptr = self.idle_record();

        unsafe { &*record_ptr }
            .ptr
            .store(ptr, atomic::Ordering::SeqCst);

        Guard::new(ptr, record_ptr)
    }

    fn protect(&mut self, src: &atomic::AtomicPtr<Descriptor>) -> Guard {
        let record_ptr = self.idle_record();
        let record = unsafe { &*record_ptr };

        // The Source has to be re-read after publishing the Hazard, as the
        // Pointer may have been retired between the first Load and the
        // Publish becoming visible
        let mut ptr = src.load(atomic::Ordering::SeqCst);
        loop {
            record.ptr.store(ptr, atomic::Ordering::SeqCst);

            let current = src.load(atomic::Ordering::SeqCst);
            if current == ptr {
                break;
            }

            ptr = current;
        }

        Guard::new(ptr, record_ptr)
    }

    /// Moves all orphaned Retire-Nodes of exited Threads into the own
    /// Retired-List
    fn adopt_orphans(&mut self) {
        let mut current = ORPHANS.swap(std::ptr::null_mut(), atomic::Ordering::SeqCst);
        while !current.is_null() {
            let orphan = unsafe { Box::from_raw(current) };
            self.retired.push(orphan.node);
            current = orphan.next;
        }
    }

    /// Reclaims every retired Descriptor that no Record currently protects
    fn scan(&mut self) {
        let mut protected = HashSet::new();

        let mut current = RECORDS.load(atomic::Ordering::SeqCst);
        while !current.is_null() {
            let record = unsafe { &*current };

            let ptr = record.ptr.load(atomic::Ordering::SeqCst);
            if !ptr.is_null() {
                protected.insert(ptr);
            }

            current = record.next.load(atomic::Ordering::SeqCst);
        }

        let pending = std::mem::take(&mut self.retired);
        for node in pending {
            if protected.contains(&node.ptr) {
                self.retired.push(node);
            } else {
                unsafe { (node.reclaim)(node.ptr) };
            }
        }
    }
}

impl Drop for Domain {
    fn drop(&mut self) {
        self.scan();

        // Whatever is still protected by other Threads gets handed over,
        // some live Thread will adopt and reclaim it later
        for node in self.retired.drain(..) {
            spill_orphan(node);
        }

        for &record in self.records.iter() {
            unsafe { &*record }.release();
        }
    }
}

/// Loads the Descriptor-Pointer from the given Location and protects it
/// from being reclaimed until the returned Guard is dropped
pub(crate) fn protect(src: &atomic::AtomicPtr<Descriptor>) -> Guard {
    DOMAIN.with(|domain| domain.borrow_mut().protect(src))
}

/// Protects a Descriptor the Caller derived from a Pointer it still owns
///
/// Unlike [`protect`] this does not re-validate any source Location, so
/// the Caller has to guarantee that the Descriptor can not have been
/// retired yet at the Time of the Call. The Free-Path satisfies this
/// because a Super-Block can not drain while the Slot being freed is
/// still outstanding
pub(crate) fn pin(ptr: *mut Descriptor) -> Guard {
    DOMAIN.with(|domain| domain.borrow_mut().pin(ptr))
}

/// Marks the given Descriptor as retired
///
/// Once no Thread protects the Descriptor anymore, `reclaim` will be
/// called with it exactly once. The Caller must have removed the
/// Descriptor from every shared Structure before retiring it
pub(crate) fn retire(ptr: *mut Descriptor, reclaim_fn: unsafe fn(*mut Descriptor)) {
    DOMAIN.with(|domain| {
        let mut domain = domain.borrow_mut();

        domain.retired.push(RetireNode {
            ptr,
            reclaim: reclaim_fn,
        });

        if domain.retired.len() >= RETIRE_THRESHOLD {
            domain.adopt_orphans();
            domain.scan();
        }
    });
}

/// Forces a Reclamation-Attempt on the calling Thread
///
/// This adopts the Retire-Lists left behind by exited Threads and then
/// reclaims everything that is no longer protected. Mostly useful to reach
/// a quiescent State in Tests and before Shutdown-Checks, the Allocator
/// itself triggers Scans automatically
pub fn reclaim() {
    DOMAIN.with(|domain| {
        let mut domain = domain.borrow_mut();
        domain.adopt_orphans();
        domain.scan();
    });
}
