use std::ptr::NonNull;

use crate::error::{DmaError, Result};
use crate::region::AddressSpace;
use crate::sg::{Prot, SgDescriptor, TranslationHint};

/// A resolved virtual-memory view of one scatter-gather descriptor.
///
/// # Why no safe slice accessors
/// The span aliases a `MAP_SHARED` mapping that the remote peer may write
/// concurrently, so handing out `&[u8]`/`&mut [u8]` for its whole lifetime
/// would violate Rust's aliasing assumptions. Callers that need bytes should
/// copy through the raw pointer for exactly as long as the refcount contract
/// holds the region alive.
#[derive(Debug, Clone, Copy)]
pub struct MappedSpan {
    base: NonNull<u8>,
    len: usize,
}

impl MappedSpan {
    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy bytes out of the span.
    ///
    /// # Panics
    /// Panics if `offset + dst.len()` exceeds the span.
    pub fn read_into(&self, offset: usize, dst: &mut [u8]) {
        assert!(offset.checked_add(dst.len()).is_some_and(|e| e <= self.len));
        // Safety: bounds asserted above; the region outlives the span per
        // the refcount contract.
        unsafe {
            std::ptr::copy_nonoverlapping(self.base.as_ptr().add(offset), dst.as_mut_ptr(), dst.len());
        }
    }

    /// Copy bytes into the span.
    ///
    /// # Panics
    /// Panics if `offset + src.len()` exceeds the span.
    pub fn write_from(&self, offset: usize, src: &[u8]) {
        assert!(offset.checked_add(src.len()).is_some_and(|e| e <= self.len));
        // Safety: bounds asserted above; the region outlives the span per
        // the refcount contract.
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.base.as_ptr().add(offset), src.len());
        }
    }
}

impl AddressSpace {
    /// Resolve scatter-gather descriptors to virtual-memory spans.
    ///
    /// Every descriptor is validated before any refcount changes: a
    /// descriptor naming a slot outside the table fails with
    /// [`DmaError::BadRegionIndex`], one naming a region that was registered
    /// without a backing descriptor with [`DmaError::RegionNotMapped`]. On
    /// success each referenced region's refcount is incremented once per
    /// descriptor.
    pub fn map_sg(&mut self, sgs: &[SgDescriptor]) -> Result<Vec<MappedSpan>> {
        for sg in sgs {
            let region = self
                .regions
                .get(sg.region)
                .ok_or(DmaError::BadRegionIndex {
                    index: sg.region,
                    nregions: self.regions.len(),
                })?;
            if region.mapping.is_none() {
                return Err(DmaError::RegionNotMapped { index: sg.region });
            }
        }

        let mut spans = Vec::with_capacity(sgs.len());
        for sg in sgs {
            let region = &mut self.regions[sg.region];
            let mapping = region.mapping.as_ref().expect("validated above");
            tracing::debug!(
                "map [{:#x}, {:#x})",
                sg.dma_addr + sg.offset,
                sg.dma_addr + sg.offset + sg.length
            );
            // Safety: translation bounded offset/length to the region, and
            // the mapping covers the whole region.
            let base = unsafe { mapping.base().add(sg.offset as usize) };
            spans.push(MappedSpan {
                base: NonNull::new(base).expect("mmap base is non-null"),
                len: sg.length as usize,
            });
            region.refcount += 1;
        }
        Ok(spans)
    }

    /// Release mappings previously produced by [`AddressSpace::map_sg`].
    ///
    /// Regions are looked up by DMA base address rather than slot index, so
    /// descriptors stay valid across table mutations. A descriptor whose
    /// region has since been removed is logged and skipped; the refcount
    /// never drops below zero.
    pub fn unmap_sg(&mut self, sgs: &[SgDescriptor]) {
        for sg in sgs {
            let Some(region) = self.regions.iter_mut().find(|r| r.dma_addr == sg.dma_addr)
            else {
                tracing::warn!(
                    "unmap of [{:#x}, +{:#x}): region no longer registered",
                    sg.dma_addr + sg.offset,
                    sg.length
                );
                continue;
            };
            tracing::debug!(
                "unmap [{:#x}, {:#x})",
                sg.dma_addr + sg.offset,
                sg.dma_addr + sg.offset + sg.length
            );
            if region.refcount == 0 {
                tracing::warn!("refcount underflow for region at {:#x}", region.dma_addr);
            } else {
                region.refcount -= 1;
            }
        }
    }

    /// Translate and map a span that fits in a single descriptor.
    pub fn map_one(
        &mut self,
        hint: &mut TranslationHint,
        dma_addr: u64,
        len: u64,
        prot: Prot,
    ) -> Result<MappedSpan> {
        let mut sg = [SgDescriptor::default(); 1];
        self.translate(hint, dma_addr, len, &mut sg, prot)?;
        let mut spans = self.map_sg(&sg)?;
        Ok(spans.remove(0))
    }

    /// Release a span mapped with [`AddressSpace::map_one`].
    pub fn unmap_one(&mut self, hint: &mut TranslationHint, dma_addr: u64, len: u64) -> Result<()> {
        let mut sg = [SgDescriptor::default(); 1];
        self.translate(hint, dma_addr, len, &mut sg, Prot::empty())?;
        self.unmap_sg(&sg);
        Ok(())
    }
}
