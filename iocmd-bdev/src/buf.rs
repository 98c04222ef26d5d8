use std::alloc::{GlobalAlloc, Layout, System};
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::{fmt, slice};

/// A zero-initialized buffer with a fixed alignment, for data passed to and from devices.
pub struct DmaBuf {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: The allocation is exclusively owned.
unsafe impl Send for DmaBuf {}
// SAFETY: Shared access is read-only.
unsafe impl Sync for DmaBuf {}

impl fmt::Debug for DmaBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaBuf")
            .field("len", &self.layout.size())
            .field("align", &self.layout.align())
            .finish_non_exhaustive()
    }
}

impl DmaBuf {
    /// Returns `None` if `len` is zero, `align` is not a power of two, or the allocation fails.
    #[must_use]
    pub fn zeroed(len: usize, align: usize) -> Option<Self> {
        if len == 0 {
            return None;
        }
        let layout = Layout::from_size_align(len, align.max(1)).ok()?;
        // SAFETY: `layout` has a non-zero size.
        let ptr = NonNull::new(unsafe { System.alloc_zeroed(layout) })?;
        Some(Self { ptr, layout })
    }

    #[must_use]
    pub fn align(&self) -> usize {
        self.layout.align()
    }
}

impl Deref for DmaBuf {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        // SAFETY: `ptr` is valid for `size` initialized bytes.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl DerefMut for DmaBuf {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: `ptr` is valid for `size` initialized bytes and exclusively borrowed.
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl Drop for DmaBuf {
    fn drop(&mut self) {
        // SAFETY: Allocated by us with the same layout.
        unsafe { System.dealloc(self.ptr.as_ptr(), self.layout) };
    }
}
