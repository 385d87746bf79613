//! Upper-layer I/O descriptors: a bio is a vector of page segments tagged
//! with a starting sector and a direction, plus a completion hook.

use std::sync::{Arc, Weak};

use crate::helpers::IoBuf;
use crate::pool::PagePoolShared;
use crate::{SECTOR_SHIFT, SECTOR_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// One data page. Pages are shared between bios (a read clone points at the
/// original bio's pages) and between a bio and in-flight cipher requests,
/// so they are reference counted and mutated only through the region
/// accessors under the single-writer-per-sector protocol.
pub struct Page {
    store: Option<IoBuf>,
    high: bool,
    pool: Option<Weak<PagePoolShared>>,
}

impl Page {
    /// Standalone page, not accounted to any pool.
    pub fn new(len: usize) -> Self {
        Page {
            store: Some(IoBuf::new(len)),
            high: false,
            pool: None,
        }
    }

    pub(crate) fn pooled(store: IoBuf, pool: Weak<PagePoolShared>) -> Self {
        Page {
            store: Some(store),
            high: false,
            pool: Some(pool),
        }
    }

    fn store(&self) -> &IoBuf {
        self.store.as_ref().unwrap()
    }

    pub fn len(&self) -> usize {
        self.store().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether this page is outside the reach of DMA-constrained cipher
    /// offload hardware. Set by the submitter; triggers the bounce shim.
    pub fn is_high(&self) -> bool {
        self.high
    }

    pub fn mark_high(&mut self) {
        self.high = true;
    }

    pub fn fill(&mut self, byte: u8) {
        let store = self.store.as_mut().unwrap();
        store.fill(byte);
    }

    pub fn copy_from(&mut self, offset: usize, src: &[u8]) {
        let store = self.store.as_mut().unwrap();
        store[offset..offset + src.len()].copy_from_slice(src);
    }

    /// # Safety
    ///
    /// No concurrent writer may touch the region, see [`IoBuf::region`].
    pub unsafe fn bytes(&self, offset: usize, len: usize) -> &[u8] {
        self.store().region(offset, len)
    }

    /// # Safety
    ///
    /// The caller must be the region's only accessor, see
    /// [`IoBuf::region_mut`].
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn bytes_mut(&self, offset: usize, len: usize) -> &mut [u8] {
        self.store().region_mut(offset, len)
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("len", &self.len())
            .field("high", &self.high)
            .field("pooled", &self.pool.is_some())
            .finish()
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.as_ref().and_then(Weak::upgrade) {
            pool.release(self.store.take().unwrap());
        }
    }
}

/// One (page, offset, length) segment of a bio. Lengths are multiples of
/// the sector size and a single sector never spans two segments.
#[derive(Clone, Debug)]
pub struct BioVec {
    pub page: Arc<Page>,
    pub offset: usize,
    pub len: usize,
}

impl BioVec {
    /// Whether two segments address the very same memory region, the
    /// in-place case of the conversion primitive.
    pub fn same_region(&self, other: &BioVec) -> bool {
        Arc::ptr_eq(&self.page, &other.page) && self.offset == other.offset
    }
}

pub type EndIo = Box<dyn FnOnce(&mut Bio, i32) + Send>;

/// An I/O descriptor handed to a crypt target or built by it (a clone
/// submitted to the backing device). Completion runs the `end_io` hook
/// exactly once with 0 or a negative errno.
pub struct Bio {
    segs: Vec<BioVec>,
    sector: u64,
    size: usize,
    dir: Direction,
    end_io: Option<EndIo>,
}

impl Bio {
    pub fn new(dir: Direction, sector: u64) -> Self {
        Bio {
            segs: Vec::new(),
            sector,
            size: 0,
            dir,
            end_io: None,
        }
    }

    pub fn with_segs(dir: Direction, sector: u64, segs: Vec<BioVec>) -> Self {
        let size = segs.iter().map(|s| s.len).sum();
        Bio {
            segs,
            sector,
            size,
            dir,
            end_io: None,
        }
    }

    pub fn push(&mut self, seg: BioVec) {
        debug_assert!(seg.len % SECTOR_SIZE == 0);
        self.size += seg.len;
        self.segs.push(seg);
    }

    pub fn segs(&self) -> &[BioVec] {
        &self.segs
    }

    pub fn seg_count(&self) -> usize {
        self.segs.len()
    }

    pub fn sector(&self) -> u64 {
        self.sector
    }

    pub fn set_sector(&mut self, sector: u64) {
        self.sector = sector;
    }

    /// Payload size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn sectors(&self) -> u64 {
        (self.size >> SECTOR_SHIFT) as u64
    }

    pub fn dir(&self) -> Direction {
        self.dir
    }

    pub fn has_high_pages(&self) -> bool {
        self.segs.iter().any(|s| s.page.is_high())
    }

    pub fn set_end_io(&mut self, f: EndIo) {
        self.end_io = Some(f);
    }

    /// Complete the bio, consuming it. Pages the bio held references to are
    /// released afterwards.
    pub fn complete(mut self, error: i32) {
        if let Some(f) = self.end_io.take() {
            f(&mut self, error);
        }
    }

    /// Copy the bio's payload into `out`, which must be at least
    /// [`Bio::size`] bytes.
    ///
    /// # Safety
    ///
    /// All writers of the underlying pages must have quiesced.
    pub unsafe fn read_payload(&self, out: &mut [u8]) {
        let mut done = 0;
        for seg in &self.segs {
            out[done..done + seg.len].copy_from_slice(seg.page.bytes(seg.offset, seg.len));
            done += seg.len;
        }
    }

    /// Fill the bio's pages from `data`, which must be at least
    /// [`Bio::size`] bytes.
    ///
    /// # Safety
    ///
    /// The caller must be the only accessor of the pages.
    pub unsafe fn write_payload(&self, data: &[u8]) {
        let mut done = 0;
        for seg in &self.segs {
            seg.page
                .bytes_mut(seg.offset, seg.len)
                .copy_from_slice(&data[done..done + seg.len]);
            done += seg.len;
        }
    }
}

impl std::fmt::Debug for Bio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bio")
            .field("dir", &self.dir)
            .field("sector", &self.sector)
            .field("size", &self.size)
            .field("segs", &self.segs.len())
            .finish()
    }
}
