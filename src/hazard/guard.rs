use crate::descriptor::Descriptor;

use super::record::Record;

/// A Guard keeps the Protection of a single Descriptor alive
///
/// As long as the Guard exists, the protected Descriptor will not be
/// handed back to the Pool or re-published on a List, so the Pointer
/// returned by [`raw`](Guard::raw) stays valid. Dropping the Guard clears
/// the Protection and makes the underlying Hazard-Record reusable by the
/// owning Thread
pub struct Guard {
    inner: *mut Descriptor,
    record: *mut Record,
}

impl Guard {
    pub(super) fn new(inner: *mut Descriptor, record: *mut Record) -> Self {
        Self { inner, record }
    }

    /// The protected Descriptor-Pointer, may be a Null-Ptr if the source
    /// Location held one at the Time of protecting
    pub fn raw(&self) -> *mut Descriptor {
        self.inner
    }
}

impl Drop for Guard {
    fn drop(&mut self) {
        unsafe { &*self.record }.reset();
    }
}
