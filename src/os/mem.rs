use std::{fmt, io, ptr};

use libc::{
    madvise, mmap, mprotect, munmap, MADV_DONTNEED, MAP_ANONYMOUS, MAP_FAILED, MAP_NORESERVE,
    MAP_PRIVATE, PROT_NONE, PROT_READ, PROT_WRITE,
};
use log::debug;
use once_cell::sync::Lazy;

use crate::{
    span::RWByteSpan,
    units::{Address, Alignment, Bytes},
    util::{hint::cold, num::round_up},
};

static PAGE_SIZE: Lazy<usize> = Lazy::new(page_size::get);

/// The size of a virtual memory page on this machine
pub fn page_size() -> Bytes {
    Bytes::new(*PAGE_SIZE)
}

/// [`page_size()`] as an [`Alignment`]
pub fn page_alignment() -> Alignment {
    Alignment::new(*PAGE_SIZE)
}

/// Why the kernel refused to give us (or change) a mapping
#[derive(Debug)]
pub struct MapError {
    pub op: &'static str,
    pub size: Bytes,
    pub source: io::Error,
}

impl MapError {
    fn last_os_error(op: &'static str, size: Bytes) -> Self {
        cold(|| Self {
            op,
            size,
            source: io::Error::last_os_error(),
        })
    }
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}) failed: {}", self.op, self.size, self.source)
    }
}

impl std::error::Error for MapError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// An anonymous, private, page-aligned mapping that is unmapped on drop.
///
/// A region is created either fully committed ([`MmapRegion::map()`]) or
/// merely reserved ([`MmapRegion::reserve()`]), in which case pages must be
/// [`commit()`](MmapRegion::commit)ted before they are touched.
pub struct MmapRegion {
    ptr: *mut u8,
    size: usize,
}

impl MmapRegion {
    /// `mmap()` a read/write region of at least `size` bytes (rounded up to
    /// whole pages, and at least one page).
    pub fn map(size: Bytes) -> Result<MmapRegion, MapError> {
        Self::map_with(size, PROT_READ | PROT_WRITE, "map")
    }

    /// Reserve at least `size` bytes of address space with no access rights
    /// and no swap reservation. Nothing is backed until it is committed.
    pub fn reserve(size: Bytes) -> Result<MmapRegion, MapError> {
        Self::map_with(size, PROT_NONE, "reserve")
    }

    fn map_with(size: Bytes, prot: i32, op: &'static str) -> Result<MmapRegion, MapError> {
        let size = round_up(size.get().max(1), *PAGE_SIZE);
        // SAFETY: an anonymous private mapping at a kernel-chosen address
        // cannot alias anything we already own.
        let ptr = unsafe {
            mmap(
                ptr::null_mut(),
                size,
                prot,
                MAP_NORESERVE | MAP_ANONYMOUS | MAP_PRIVATE,
                -1,
                0,
            )
        };
        if ptr == MAP_FAILED {
            return Err(MapError::last_os_error(op, Bytes::new(size)));
        }
        debug!("mmap {op}: {} bytes at {:?}", size, ptr);
        Ok(MmapRegion {
            ptr: ptr as *mut u8,
            size,
        })
    }

    pub fn base(&self) -> Address {
        Address::new(self.ptr)
    }

    pub fn size(&self) -> Bytes {
        Bytes::new(self.size)
    }

    /// The whole region as a span
    pub fn span(&self) -> RWByteSpan {
        RWByteSpan::from_raw_parts(self.ptr, self.size())
    }

    fn debug_assert_page_range(&self, span: RWByteSpan) {
        debug_assert!(self.span().contains(&span.into()), "range outside region");
        debug_assert!(span.is_aligned_to(page_alignment()), "range not page aligned");
        debug_assert!(span.len().get() % *PAGE_SIZE == 0, "range not whole pages");
    }

    /// Make `span` readable and writable. `span` must be whole pages inside
    /// this region.
    pub fn commit(&self, span: RWByteSpan) -> Result<(), MapError> {
        if span.is_empty() {
            return Ok(());
        }
        self.debug_assert_page_range(span);
        // SAFETY: the range is inside our own mapping
        let rc = unsafe { mprotect(span.as_ptr() as _, span.len().get(), PROT_READ | PROT_WRITE) };
        if rc != 0 {
            return Err(MapError::last_os_error("commit", span.len()));
        }
        Ok(())
    }

    /// Release the physical pages behind `span` and revoke access to them.
    /// The address range stays reserved.
    ///
    /// # Safety
    ///
    /// Nothing may read or write `span` until it is committed again, and its
    /// contents are lost.
    pub unsafe fn decommit(&self, span: RWByteSpan) -> Result<(), MapError> {
        if span.is_empty() {
            return Ok(());
        }
        self.debug_assert_page_range(span);
        // SAFETY: the range is inside our own mapping; the caller promises
        // nobody is using the contents.
        let rc = unsafe { madvise(span.as_ptr() as _, span.len().get(), MADV_DONTNEED) };
        if rc != 0 {
            return Err(MapError::last_os_error("decommit", span.len()));
        }
        let rc = unsafe { mprotect(span.as_ptr() as _, span.len().get(), PROT_NONE) };
        if rc != 0 {
            return Err(MapError::last_os_error("decommit", span.len()));
        }
        Ok(())
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        debug!("munmap {} bytes at {:?}", self.size, self.ptr);
        // SAFETY:
        // - The address addr must be a multiple of the page size (but length
        //   need not be). This is guaranteed true because we can only construct
        //   this region as page-aligned
        // - All pages containing a part of the indicated range are unmapped.
        //   This is fine, because we requested a region of at least `self.size`
        //   bytes and never mutated it.
        unsafe {
            munmap(self.ptr as _, self.size);
        }
    }
}

impl fmt::Debug for MmapRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MmapRegion")
            .field("base", &self.base())
            .field("size", &self.size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapped_region_is_whole_pages_and_writable() {
        let region = MmapRegion::map(Bytes::new(100)).unwrap();
        assert_eq!(region.size(), page_size());
        assert!(region.base().is_aligned_to(page_alignment()));
        let bytes = unsafe { region.span().as_mut_slice() };
        bytes[0] = 1;
        bytes[99] = 2;
        assert_eq!(bytes[0] + bytes[99], 3);
    }

    #[test]
    fn reserved_pages_can_be_committed_and_decommitted() {
        let region = MmapRegion::reserve(page_size() * 4).unwrap();
        let second = RWByteSpan::from_address(region.base().add(page_size()), page_size());
        region.commit(second).unwrap();
        (unsafe { second.as_mut_slice() })[0] = 0xab;
        assert_eq!(unsafe { second.as_read_only().as_slice() }[0], 0xab);
        unsafe { region.decommit(second) }.unwrap();
        region.commit(second).unwrap();
        // MADV_DONTNEED on a private anonymous mapping gives back zero pages
        assert_eq!(unsafe { second.as_read_only().as_slice() }[0], 0);
    }
}
