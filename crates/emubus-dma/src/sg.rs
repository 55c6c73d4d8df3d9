use bitflags::bitflags;

use crate::error::{DmaError, Result};
use crate::region::AddressSpace;

bitflags! {
    /// Access intent for a translation. Write intent feeds dirty logging.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Prot: u32 {
        const READ = 1;
        const WRITE = 2;
    }
}

/// One contiguous, region-resolved slice of a DMA request.
///
/// Ephemeral: valid only while the referenced region stays registered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SgDescriptor {
    /// Slot index of the region in the table at translation time.
    pub region: usize,
    /// DMA base address of that region.
    pub dma_addr: u64,
    /// Byte offset of this slice within the region.
    pub offset: u64,
    /// Slice length in bytes.
    pub length: u64,
}

/// Single-slot most-recently-used region cache for the translation fast
/// path.
///
/// Repeated DMA tends to hit the same buffer, so remembering the last
/// region makes the common case O(1). The hint is owned by one execution
/// context (e.g. one worker thread); contexts must not share a hint, though
/// they may share the table itself under a read lock.
#[derive(Debug, Clone, Copy, Default)]
pub struct TranslationHint {
    region: usize,
}

impl AddressSpace {
    /// Translate the linear span `[dma_addr, dma_addr + len)` into
    /// scatter-gather descriptors written to `out`.
    ///
    /// Returns the number of descriptors produced. A span needing more
    /// descriptors than `out` holds fails with
    /// [`DmaError::TooManyDescriptors`] carrying the required count (see
    /// [`DmaError::to_raw`] for the wire encoding). A zero-length span, an
    /// empty `out`, or a span not fully covered by registered regions is an
    /// argument error with no side effects.
    ///
    /// When dirty logging is active and `prot` includes write intent, each
    /// produced descriptor's page range is marked dirty.
    pub fn translate(
        &mut self,
        hint: &mut TranslationHint,
        dma_addr: u64,
        len: u64,
        out: &mut [SgDescriptor],
        prot: Prot,
    ) -> Result<usize> {
        if len == 0 {
            return Err(DmaError::InvalidSpan { dma_addr, len });
        }
        if out.is_empty() {
            return Err(DmaError::ZeroCapacity);
        }
        let end = dma_addr
            .checked_add(len)
            .ok_or(DmaError::InvalidSpan { dma_addr, len })?;

        // Fast path: the hinted region fully contains the span.
        if let Some(region) = self.regions.get(hint.region) {
            if region.contains(dma_addr, end) {
                out[0] = SgDescriptor {
                    region: hint.region,
                    dma_addr: region.dma_addr,
                    offset: dma_addr - region.dma_addr,
                    length: len,
                };
                self.mark_dirty_for_write(prot, &out[..1]);
                return Ok(1);
            }
        }

        let count = self.split(dma_addr, end, len, out)?;
        self.mark_dirty_for_write(prot, &out[..count]);
        hint.region = out[0].region;
        Ok(count)
    }

    /// Slow path: walk the sorted table, splitting the span across as many
    /// contiguous regions as it covers.
    fn split(&self, dma_addr: u64, end: u64, len: u64, out: &mut [SgDescriptor]) -> Result<usize> {
        let mut idx = self.regions.partition_point(|r| r.end() <= dma_addr);
        let first = self
            .regions
            .get(idx)
            .filter(|r| r.dma_addr <= dma_addr)
            .ok_or(DmaError::NotRegistered { dma_addr, len })?;

        let mut cursor = dma_addr;
        let mut produced = 0usize;
        let mut region = first;
        loop {
            let slice_end = end.min(region.end());
            if produced < out.len() {
                out[produced] = SgDescriptor {
                    region: idx,
                    dma_addr: region.dma_addr,
                    offset: cursor - region.dma_addr,
                    length: slice_end - cursor,
                };
            }
            produced += 1;
            cursor = slice_end;
            if cursor == end {
                break;
            }
            idx += 1;
            region = self
                .regions
                .get(idx)
                // A gap before the next region means the span crosses
                // unregistered address space.
                .filter(|r| r.dma_addr == cursor)
                .ok_or(DmaError::NotRegistered { dma_addr, len })?;
        }

        if produced > out.len() {
            return Err(DmaError::TooManyDescriptors { needed: produced });
        }
        Ok(produced)
    }
}
