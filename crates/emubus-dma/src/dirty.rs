use crate::error::{DmaError, Result};
use crate::region::{bitmap_bytes, AddressSpace};
use crate::sg::{Prot, SgDescriptor};

impl AddressSpace {
    /// Begin dirty page logging at `pgsize` granularity.
    ///
    /// Allocates a zeroed bitmap of one bit per `pgsize`-sized page for every
    /// registered region; regions added later get theirs at registration.
    /// Calling again with the same granularity is a no-op; a different
    /// granularity while active is an error.
    pub fn start_dirty_logging(&mut self, pgsize: u64) -> Result<()> {
        if pgsize == 0 {
            return Err(DmaError::BadPageSize);
        }
        if self.dirty_pgsize != 0 {
            if self.dirty_pgsize == pgsize {
                return Ok(());
            }
            return Err(DmaError::PageSizeMismatch {
                requested: pgsize,
                active: self.dirty_pgsize,
            });
        }

        self.dirty_pgsize = pgsize;
        for region in &mut self.regions {
            region.dirty = Some(vec![0u8; bitmap_bytes(region.size, pgsize)]);
        }
        tracing::debug!("dirty logging started at {pgsize}-byte granularity");
        Ok(())
    }

    /// Stop dirty page logging and discard all bitmaps. Idempotent.
    pub fn stop_dirty_logging(&mut self) {
        self.dirty_pgsize = 0;
        for region in &mut self.regions {
            region.dirty = None;
        }
    }

    pub fn dirty_logging_active(&self) -> bool {
        self.dirty_pgsize != 0
    }

    /// Number of bytes [`AddressSpace::dirty_snapshot`] will write for the
    /// exact region `[dma_addr, dma_addr + len)`.
    pub fn dirty_snapshot_len(&self, dma_addr: u64, len: u64) -> Result<usize> {
        if self.dirty_pgsize == 0 {
            return Err(DmaError::DirtyLoggingNotActive);
        }
        self.find_region(dma_addr, len)
            .ok_or(DmaError::NoSuchRegion {
                dma_addr,
                size: len,
            })?;
        Ok(bitmap_bytes(len, self.dirty_pgsize))
    }

    /// Copy the dirty bitmap of the region registered at exactly
    /// `[dma_addr, dma_addr + len)` into `out` for transmission.
    ///
    /// `pgsize` must match the active logging granularity, and `out` must be
    /// exactly the bitmap's size (see
    /// [`AddressSpace::dirty_snapshot_len`]).
    pub fn dirty_snapshot(&self, dma_addr: u64, len: u64, pgsize: u64, out: &mut [u8]) -> Result<()> {
        if self.dirty_pgsize == 0 {
            return Err(DmaError::DirtyLoggingNotActive);
        }
        if pgsize != self.dirty_pgsize {
            return Err(DmaError::PageSizeMismatch {
                requested: pgsize,
                active: self.dirty_pgsize,
            });
        }
        let idx = self
            .find_region(dma_addr, len)
            .ok_or(DmaError::NoSuchRegion {
                dma_addr,
                size: len,
            })?;

        let bitmap = self.regions[idx]
            .dirty
            .as_deref()
            .expect("active logging allocates a bitmap per region");
        if out.len() != bitmap.len() {
            return Err(DmaError::SnapshotBufferSize {
                expected: bitmap.len(),
                got: out.len(),
            });
        }
        out.copy_from_slice(bitmap);
        Ok(())
    }

    /// Mark the page range covered by each descriptor dirty when the
    /// translation carried write intent and logging is active.
    pub(crate) fn mark_dirty_for_write(&mut self, prot: Prot, sgs: &[SgDescriptor]) {
        if !prot.contains(Prot::WRITE) || self.dirty_pgsize == 0 {
            return;
        }
        let pgsize = self.dirty_pgsize;
        for sg in sgs {
            let region = &mut self.regions[sg.region];
            let Some(bitmap) = region.dirty.as_deref_mut() else {
                continue;
            };
            // Inclusive page index range relative to the region's start.
            let start = sg.offset / pgsize;
            let end = (sg.offset + sg.length - 1) / pgsize;
            for page in start..=end {
                bitmap[(page / 8) as usize] |= 1 << (page % 8);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sg::TranslationHint;

    const PGSIZE: u64 = 0x1000;

    fn translated_write(aspace: &mut AddressSpace, dma_addr: u64, len: u64) {
        let mut hint = TranslationHint::default();
        let mut sgs = [SgDescriptor::default(); 8];
        aspace
            .translate(&mut hint, dma_addr, len, &mut sgs, Prot::WRITE)
            .unwrap();
    }

    fn snapshot(aspace: &AddressSpace, dma_addr: u64, len: u64) -> Vec<u8> {
        let mut out = vec![0u8; aspace.dirty_snapshot_len(dma_addr, len).unwrap()];
        aspace.dirty_snapshot(dma_addr, len, PGSIZE, &mut out).unwrap();
        out
    }

    #[test]
    fn write_translations_mark_pages() {
        let mut aspace = AddressSpace::new(4);
        aspace.add_region(0x10000, 8 * PGSIZE, None, 0).unwrap();
        aspace.start_dirty_logging(PGSIZE).unwrap();

        // Pages 2 and 3 (write straddles the boundary).
        translated_write(&mut aspace, 0x10000 + 2 * PGSIZE + 0xF00, 0x200);
        assert_eq!(snapshot(&aspace, 0x10000, 8 * PGSIZE), vec![0b0000_1100]);

        // Read-intent translations leave the bitmap untouched.
        let mut hint = TranslationHint::default();
        let mut sgs = [SgDescriptor::default(); 1];
        aspace
            .translate(&mut hint, 0x10000, PGSIZE, &mut sgs, Prot::READ)
            .unwrap();
        assert_eq!(snapshot(&aspace, 0x10000, 8 * PGSIZE), vec![0b0000_1100]);
    }

    #[test]
    fn marking_is_idempotent() {
        let mut aspace = AddressSpace::new(4);
        aspace.add_region(0x10000, 8 * PGSIZE, None, 0).unwrap();
        aspace.start_dirty_logging(PGSIZE).unwrap();

        translated_write(&mut aspace, 0x10000 + PGSIZE, PGSIZE);
        let once = snapshot(&aspace, 0x10000, 8 * PGSIZE);
        translated_write(&mut aspace, 0x10000 + PGSIZE, PGSIZE);
        assert_eq!(snapshot(&aspace, 0x10000, 8 * PGSIZE), once);
    }

    #[test]
    fn restart_resets_to_zero_state() {
        let mut aspace = AddressSpace::new(4);
        aspace.add_region(0x10000, 4 * PGSIZE, None, 0).unwrap();
        aspace.start_dirty_logging(PGSIZE).unwrap();
        translated_write(&mut aspace, 0x10000, 2 * PGSIZE);

        aspace.stop_dirty_logging();
        assert!(matches!(
            aspace.dirty_snapshot_len(0x10000, 4 * PGSIZE),
            Err(DmaError::DirtyLoggingNotActive)
        ));

        aspace.start_dirty_logging(PGSIZE).unwrap();
        assert_eq!(snapshot(&aspace, 0x10000, 4 * PGSIZE), vec![0]);
    }

    #[test]
    fn start_is_idempotent_for_same_granularity_only() {
        let mut aspace = AddressSpace::new(4);
        aspace.start_dirty_logging(PGSIZE).unwrap();
        aspace.start_dirty_logging(PGSIZE).unwrap();
        assert!(matches!(
            aspace.start_dirty_logging(2 * PGSIZE),
            Err(DmaError::PageSizeMismatch { .. })
        ));
        assert!(matches!(
            aspace.start_dirty_logging(0),
            Err(DmaError::BadPageSize)
        ));
    }

    #[test]
    fn snapshot_validates_granularity_region_and_buffer() {
        let mut aspace = AddressSpace::new(4);
        aspace.add_region(0x10000, 4 * PGSIZE, None, 0).unwrap();
        aspace.start_dirty_logging(PGSIZE).unwrap();

        let mut out = [0u8; 1];
        assert!(matches!(
            aspace.dirty_snapshot(0x10000, 4 * PGSIZE, 2 * PGSIZE, &mut out),
            Err(DmaError::PageSizeMismatch { .. })
        ));
        assert!(matches!(
            aspace.dirty_snapshot(0x10000, 2 * PGSIZE, PGSIZE, &mut out),
            Err(DmaError::NoSuchRegion { .. })
        ));
        let mut wrong = [0u8; 9];
        assert!(matches!(
            aspace.dirty_snapshot(0x10000, 4 * PGSIZE, PGSIZE, &mut wrong),
            Err(DmaError::SnapshotBufferSize {
                expected: 1,
                got: 9
            })
        ));
    }

    #[test]
    fn regions_added_while_active_are_tracked() {
        let mut aspace = AddressSpace::new(4);
        aspace.start_dirty_logging(PGSIZE).unwrap();
        aspace.add_region(0x20000, 2 * PGSIZE, None, 0).unwrap();

        translated_write(&mut aspace, 0x20000, 1);
        assert_eq!(snapshot(&aspace, 0x20000, 2 * PGSIZE), vec![0b01]);
    }
}
