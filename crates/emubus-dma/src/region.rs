use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::os::fd::{AsFd, OwnedFd};
use std::ptr::NonNull;

use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};

use crate::error::{DmaError, Result};

/// A process-local read/write mapping of one region's backing descriptor.
///
/// Created exactly once, at registration, and released when the region is
/// removed (or the table dropped).
#[derive(Debug)]
pub(crate) struct Mapping {
    base: NonNull<c_void>,
    len: usize,
}

impl Mapping {
    fn new(fd: impl AsFd, len: usize, offset: i64) -> Result<Self> {
        let len_nz = NonZeroUsize::new(len).ok_or(DmaError::EmptyRegion { dma_addr: 0 })?;
        // Safety: mapping a caller-provided fd at an offset it controls; the
        // kernel validates both. The mapping is owned by `Mapping` and only
        // released in `Drop`.
        let base = unsafe {
            mmap(
                None,
                len_nz,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                fd,
                offset,
            )?
        };
        Ok(Self { base, len })
    }

    pub(crate) fn base(&self) -> *mut u8 {
        self.base.as_ptr().cast()
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // Safety: `base`/`len` came from a successful mmap and are unmapped
        // exactly once.
        if let Err(err) = unsafe { munmap(self.base, self.len) } {
            tracing::warn!("munmap of {} bytes failed: {err}", self.len);
        }
    }
}

// The mapping is an owned virtual range; the raw pointer is not aliased
// elsewhere except through `MappedSpan`s handed out under the refcount
// contract.
unsafe impl Send for Mapping {}

#[derive(Debug)]
pub(crate) struct Region {
    pub(crate) dma_addr: u64,
    pub(crate) size: u64,
    pub(crate) fd: Option<OwnedFd>,
    pub(crate) offset: i64,
    pub(crate) mapping: Option<Mapping>,
    pub(crate) refcount: u32,
    pub(crate) dirty: Option<Vec<u8>>,
}

impl Region {
    pub(crate) fn end(&self) -> u64 {
        // Insertion validated `dma_addr + size` against overflow.
        self.dma_addr + self.size
    }

    pub(crate) fn contains(&self, dma_addr: u64, end: u64) -> bool {
        dma_addr >= self.dma_addr && end <= self.end()
    }
}

/// The synthetic 64-bit DMA address space: a bounded table of registered
/// memory regions, kept sorted by base address and pairwise disjoint.
#[derive(Debug)]
pub struct AddressSpace {
    max_regions: usize,
    pub(crate) regions: Vec<Region>,
    pub(crate) dirty_pgsize: u64,
}

impl AddressSpace {
    /// Create an address space holding at most `max_regions` regions.
    pub fn new(max_regions: usize) -> Self {
        Self {
            max_regions,
            regions: Vec::with_capacity(max_regions),
            dirty_pgsize: 0,
        }
    }

    pub fn nregions(&self) -> usize {
        self.regions.len()
    }

    pub fn max_regions(&self) -> usize {
        self.max_regions
    }

    /// Register a new region at `[dma_addr, dma_addr + size)`.
    ///
    /// A backing descriptor, when present, is mapped into process memory
    /// read/write immediately; regions without one are tracked but cannot be
    /// mapped. Returns the region's slot index. A span overlapping a
    /// registered region fails with [`DmaError::Overlap`] carrying the slot
    /// the region would have sorted at, and leaves the table unchanged.
    pub fn add_region(
        &mut self,
        dma_addr: u64,
        size: u64,
        fd: Option<OwnedFd>,
        offset: i64,
    ) -> Result<usize> {
        if size == 0 {
            return Err(DmaError::EmptyRegion { dma_addr });
        }
        let end = dma_addr
            .checked_add(size)
            .ok_or(DmaError::SpanOverflow { dma_addr, size })?;

        let idx = self.regions.partition_point(|r| r.dma_addr < dma_addr);
        if idx > 0 && self.regions[idx - 1].end() > dma_addr {
            return Err(DmaError::Overlap {
                dma_addr,
                would_insert_at: idx,
            });
        }
        if idx < self.regions.len() && self.regions[idx].dma_addr < end {
            return Err(DmaError::Overlap {
                dma_addr,
                would_insert_at: idx,
            });
        }
        if self.regions.len() == self.max_regions {
            return Err(DmaError::TableFull {
                max_regions: self.max_regions,
            });
        }

        let mapping = match &fd {
            Some(fd) => Some(Mapping::new(fd.as_fd(), size as usize, offset)?),
            None => None,
        };

        let dirty = if self.dirty_pgsize != 0 {
            Some(vec![0u8; bitmap_bytes(size, self.dirty_pgsize)])
        } else {
            None
        };

        self.regions.insert(
            idx,
            Region {
                dma_addr,
                size,
                fd,
                offset,
                mapping,
                refcount: 0,
                dirty,
            },
        );
        tracing::debug!(
            "registered region {idx}: [{dma_addr:#x}, {end:#x}) offset {offset:#x}"
        );
        Ok(idx)
    }

    /// Remove the region registered at exactly `[dma_addr, dma_addr + size)`.
    ///
    /// If the region has a live virtual mapping, `on_unmap` is invoked with
    /// the region's span before anything is released, so collaborators can
    /// invalidate cached mappings. Removal is refused with
    /// [`DmaError::RegionBusy`] while the refcount is non-zero after the
    /// callback ran.
    pub fn remove_region(
        &mut self,
        dma_addr: u64,
        size: u64,
        mut on_unmap: Option<&mut dyn FnMut(u64, u64)>,
    ) -> Result<()> {
        let idx = self
            .find_region(dma_addr, size)
            .ok_or(DmaError::NoSuchRegion { dma_addr, size })?;

        if self.regions[idx].mapping.is_some() {
            if let Some(cb) = on_unmap.as_deref_mut() {
                cb(dma_addr, size);
            }
        }

        let refcount = self.regions[idx].refcount;
        if refcount > 0 {
            return Err(DmaError::RegionBusy { dma_addr, refcount });
        }

        // Dropping the region unmaps its virtual range and closes the fd.
        self.regions.remove(idx);
        tracing::debug!("removed region [{dma_addr:#x}, +{size:#x})");
        Ok(())
    }

    /// Whether `[dma_addr, dma_addr + size)` lies entirely within one
    /// registered region.
    pub fn valid(&self, dma_addr: u64, size: u64) -> bool {
        if size == 0 {
            return false;
        }
        let Some(end) = dma_addr.checked_add(size) else {
            return false;
        };
        let idx = self.regions.partition_point(|r| r.end() <= dma_addr);
        self.regions
            .get(idx)
            .is_some_and(|r| r.contains(dma_addr, end))
    }

    /// Index of the region registered at exactly `[dma_addr, dma_addr + size)`.
    pub fn find_region(&self, dma_addr: u64, size: u64) -> Option<usize> {
        let idx = self.regions.partition_point(|r| r.dma_addr < dma_addr);
        let r = self.regions.get(idx)?;
        (r.dma_addr == dma_addr && r.size == size).then_some(idx)
    }

    /// Current mapping refcount of the region at `index`.
    pub fn refcount(&self, index: usize) -> Option<u32> {
        self.regions.get(index).map(|r| r.refcount)
    }
}

pub(crate) fn bitmap_bytes(region_size: u64, pgsize: u64) -> usize {
    (region_size.div_ceil(pgsize).div_ceil(8)) as usize
}
