//! A Lock-Free LIFO of Descriptors
//!
//! The List is intrusive, the Descriptors are linked through their own
//! Link-Word, so pushing and popping never allocates. It backs both the
//! Partial-List of every Size-Class and the global Descriptor-Pool.
//!
//! Popping protects the read Head with a Hazard-Pointer before touching
//! its Link-Word. That alone would not rule out the classic ABA-Problem of
//! a Treiber-Stack, so every Re-Publication of a Descriptor that other
//! Threads might still examine has to go through
//! [`hazard::retire`](crate::hazard::retire), which delays the Push until
//! all Protections on the Node have drained

use std::sync::atomic;

use crate::{descriptor::Descriptor, hazard};

/// A Lock-Free Collection of Descriptor-Pointers
///
/// This structure does not provide any garantues about the order of
/// elements
pub struct DescriptorList {
    head: atomic::AtomicPtr<Descriptor>,
}

impl DescriptorList {
    pub const fn new() -> Self {
        Self {
            head: atomic::AtomicPtr::new(std::ptr::null_mut()),
        }
    }

    /// Pushes a single Descriptor onto the List
    ///
    /// # Safety
    /// The Descriptor must not be protected by any Hazard-Record, i.e. it
    /// is freshly allocated Batch-Memory or was just handed back by the
    /// Hazard-Pointer Service. Anything else re-opens the ABA-Window of
    /// the Pop
    pub unsafe fn push(&self, descriptor: *mut Descriptor) {
        unsafe { self.push_chain(descriptor, descriptor) };
    }

    /// Splices a pre-linked Chain of Descriptors onto the List with a
    /// single CAS
    ///
    /// # Safety
    /// Same Requirements as [`push`](DescriptorList::push) for every
    /// Descriptor in the Chain, additionally `first` must reach `last`
    /// through the Link-Words
    pub unsafe fn push_chain(&self, first: *mut Descriptor, last: *mut Descriptor) {
        loop {
            let head = self.head.load(atomic::Ordering::SeqCst);
            unsafe { &*last }.next.store(head, atomic::Ordering::SeqCst);

            if self
                .head
                .compare_exchange(
                    head,
                    first,
                    atomic::Ordering::SeqCst,
                    atomic::Ordering::SeqCst,
                )
                .is_ok()
            {
                return;
            }
        }
    }

    /// Pops the most recently pushed Descriptor, the Caller becomes its
    /// sole Owner
    pub fn try_pop(&self) -> Option<*mut Descriptor> {
        loop {
            let guard = hazard::protect(&self.head);

            let head = guard.raw();
            if head.is_null() {
                return None;
            }

            // The Hazard keeps the Record alive and un-republished, so the
            // Link-Word read here can not belong to a recycled Node
            let next = unsafe { &*head }.next.load(atomic::Ordering::SeqCst);

            if self
                .head
                .compare_exchange(
                    head,
                    next,
                    atomic::Ordering::SeqCst,
                    atomic::Ordering::SeqCst,
                )
                .is_ok()
            {
                return Some(head);
            }
        }
    }

    /// Walks the List without modifying it
    ///
    /// The Walk is only exact while no other Thread pushes or pops
    /// concurrently, which is fine for the Consistency-Checker this backs
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            current: self.head.load(atomic::Ordering::SeqCst),
            _list: self,
        }
    }
}

impl Default for DescriptorList {
    fn default() -> Self {
        Self::new()
    }
}

/// The read-only Walker over a [`DescriptorList`]
pub struct Iter<'l> {
    current: *mut Descriptor,
    _list: &'l DescriptorList,
}

impl<'l> Iterator for Iter<'l> {
    type Item = *mut Descriptor;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current.is_null() {
            return None;
        }

        let item = self.current;
        self.current = unsafe { &*item }.next.load(atomic::Ordering::SeqCst);

        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank_descriptor() -> *mut Descriptor {
        Box::into_raw(Box::new(Descriptor::blank()))
    }

    #[test]
    fn new() {
        DescriptorList::new();
    }

    #[test]
    fn pop_empty() {
        let list = DescriptorList::new();

        assert_eq!(None, list.try_pop());
    }

    #[test]
    fn push_pop_multiple() {
        let list = DescriptorList::new();

        let first = blank_descriptor();
        let second = blank_descriptor();

        unsafe { list.push(first) };
        unsafe { list.push(second) };

        assert_eq!(Some(second), list.try_pop());
        assert_eq!(Some(first), list.try_pop());
        assert_eq!(None, list.try_pop());

        drop(unsafe { Box::from_raw(first) });
        drop(unsafe { Box::from_raw(second) });
    }

    #[test]
    fn push_chain_splices_in_order() {
        let list = DescriptorList::new();

        let first = blank_descriptor();
        let second = blank_descriptor();
        unsafe { &*first }
            .next
            .store(second, atomic::Ordering::SeqCst);

        unsafe { list.push_chain(first, second) };

        assert_eq!(Some(first), list.try_pop());
        assert_eq!(Some(second), list.try_pop());
        assert_eq!(None, list.try_pop());

        drop(unsafe { Box::from_raw(first) });
        drop(unsafe { Box::from_raw(second) });
    }

    #[test]
    fn iter_walks_without_popping() {
        let list = DescriptorList::new();

        let first = blank_descriptor();
        let second = blank_descriptor();

        unsafe { list.push(first) };
        unsafe { list.push(second) };

        let walked: Vec<_> = list.iter().collect();
        assert_eq!(vec![second, first], walked);

        // Still fully populated afterwards
        assert_eq!(Some(second), list.try_pop());
        assert_eq!(Some(first), list.try_pop());

        drop(unsafe { Box::from_raw(first) });
        drop(unsafe { Box::from_raw(second) });
    }
}
