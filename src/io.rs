//! Per-request lifecycle and the sector-by-sector data path.
//!
//! Every bio handed to a target gets a [`CryptIo`] that survives until its
//! last pending sub-operation completes. The conversion context walks the
//! (source, destination) bio pair one sector at a time; writes encrypt
//! into freshly allocated clones which are submitted to the backing
//! device, reads fetch ciphertext through a page-sharing clone first and
//! decrypt in place on a second worker pass.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::bio::{Bio, BioVec, Direction};
use crate::cipher::{convert_sector, Backend, CipherToken, WriteBarrier, WRITE_TIMEOUT};
use crate::ctrl::CryptConfig;
use crate::pool::IoPermit;
use crate::{MIN_BIO_PAGES, PAGE_SIZE, SECTOR_SIZE};

/// Lifecycle object owning one upper-layer bio for the duration of its
/// encrypted or decrypted journey.
pub struct CryptIo {
    pub(crate) cc: Arc<CryptConfig>,
    base_bio: Mutex<Option<Bio>>,
    /// The submitter's bio when a bounce view was installed; `base_bio`
    /// then points at the low-page substitute.
    bounce_orig: Mutex<Option<Bio>>,
    pending: AtomicU32,
    error: AtomicI32,
    post_process: AtomicBool,
    _permit: IoPermit,
}

impl CryptIo {
    fn new(cc: Arc<CryptConfig>, base: Bio, bounce_orig: Option<Bio>, permit: IoPermit) -> Self {
        CryptIo {
            cc,
            base_bio: Mutex::new(Some(base)),
            bounce_orig: Mutex::new(bounce_orig),
            pending: AtomicU32::new(0),
            error: AtomicI32::new(0),
            post_process: AtomicBool::new(false),
            _permit: permit,
        }
    }

    pub(crate) fn inc_pending(&self) {
        self.pending.fetch_add(1, Ordering::SeqCst);
    }

    fn base_info(&self) -> (Vec<BioVec>, u64, usize, Direction) {
        let guard = self.base_bio.lock().unwrap();
        let bio = guard.as_ref().expect("io already completed");
        (bio.segs().to_vec(), bio.sector(), bio.size(), bio.dir())
    }
}

/// Drop one pending reference, latching the first failure. The reference
/// hitting zero completes the original bio exactly once and recycles the
/// lifecycle object.
pub(crate) fn dec_pending(io: &Arc<CryptIo>, error: i32) {
    if error < 0 {
        let _ = io
            .error
            .compare_exchange(0, error, Ordering::SeqCst, Ordering::SeqCst);
    }

    let prev = io.pending.fetch_sub(1, Ordering::SeqCst);
    debug_assert!(prev > 0);
    if prev != 1 {
        return;
    }

    let error = io.error.load(Ordering::SeqCst);
    let bio = io
        .base_bio
        .lock()
        .unwrap()
        .take()
        .expect("io completed twice");
    match io.bounce_orig.lock().unwrap().take() {
        Some(orig) => finish_bounce(bio, orig, error),
        None => bio.complete(error),
    }
}

/// Mapper entry: allocate the lifecycle object (from a pool that
/// guarantees progress), install a bounce view when the cipher backend
/// cannot address the bio's pages, and hand the request to the worker
/// queue. No cryptography happens in the caller's context.
pub(crate) fn map_io(cc: &Arc<CryptConfig>, bio: Bio) {
    let permit = cc.io_pool.reserve();

    let (base, orig) = if !cc.backend.dma_highmem() && bio.has_high_pages() {
        let (bounced, orig) = build_bounce(cc, bio);
        (bounced, Some(orig))
    } else {
        (bio, None)
    };

    let io = Arc::new(CryptIo::new(cc.clone(), base, orig, permit));
    cc.queue.queue_io(io);
}

/// Worker dispatch by direction and phase.
pub(crate) fn process_io(io: Arc<CryptIo>) {
    if io.post_process.load(Ordering::SeqCst) {
        process_read_endio(io);
    } else {
        let (_, _, _, dir) = io.base_info();
        match dir {
            Direction::Read => process_read(io),
            Direction::Write => process_write(io),
        }
    }
}

/// Cursor over a (source, destination) bio pair advancing one sector at a
/// time; carries the running sector number IVs are derived from.
pub(crate) struct ConvertContext {
    in_segs: Vec<BioVec>,
    out_segs: Vec<BioVec>,
    idx_in: usize,
    offset_in: usize,
    idx_out: usize,
    offset_out: usize,
    sector: u64,
    dir: Direction,
}

impl ConvertContext {
    pub(crate) fn new(
        cc: &CryptConfig,
        in_segs: Vec<BioVec>,
        out_segs: Vec<BioVec>,
        sector: u64,
        dir: Direction,
    ) -> Self {
        ConvertContext {
            in_segs,
            out_segs,
            idx_in: 0,
            offset_in: 0,
            idx_out: 0,
            offset_out: 0,
            sector: sector + cc.iv_offset,
            dir,
        }
    }

    /// Install a new destination, keeping the source cursor. The write
    /// loop re-enters with a fresh clone when the previous one was short.
    pub(crate) fn set_out(&mut self, out_segs: Vec<BioVec>) {
        self.out_segs = out_segs;
        self.idx_out = 0;
        self.offset_out = 0;
    }

    fn has_work(&self) -> bool {
        self.idx_in < self.in_segs.len() && self.idx_out < self.out_segs.len()
    }

    fn out_done(&self) -> bool {
        self.idx_out >= self.out_segs.len()
    }

    fn next_pair(&mut self) -> (BioVec, BioVec) {
        let seg_in = &self.in_segs[self.idx_in];
        let seg_out = &self.out_segs[self.idx_out];
        debug_assert!(seg_in.len % SECTOR_SIZE == 0 && seg_out.len % SECTOR_SIZE == 0);

        let sg_in = BioVec {
            page: seg_in.page.clone(),
            offset: seg_in.offset + self.offset_in,
            len: SECTOR_SIZE,
        };
        let sg_out = BioVec {
            page: seg_out.page.clone(),
            offset: seg_out.offset + self.offset_out,
            len: SECTOR_SIZE,
        };

        self.offset_in += SECTOR_SIZE;
        if self.offset_in >= seg_in.len {
            self.offset_in = 0;
            self.idx_in += 1;
        }
        self.offset_out += SECTOR_SIZE;
        if self.offset_out >= seg_out.len {
            self.offset_out = 0;
            self.idx_out += 1;
        }

        (sg_in, sg_out)
    }
}

/// Encrypt or decrypt data from one bio to another (possibly the same
/// one), sector by sector, until either cursor runs out.
pub(crate) fn crypt_convert(
    cc: &CryptConfig,
    ctx: &mut ConvertContext,
    io: &Arc<CryptIo>,
) -> Result<(), i32> {
    let barrier = match (&cc.backend, ctx.dir) {
        (Backend::Offload { .. }, Direction::Write) => Some(WriteBarrier::new()),
        _ => None,
    };
    let mut submitted = 0u32;
    let mut ret = Ok(());

    while ctx.has_work() {
        let (sg_in, sg_out) = ctx.next_pair();

        let token = if cc.backend.is_offload() {
            match ctx.dir {
                Direction::Write => {
                    submitted += 1;
                    CipherToken::Write(barrier.clone().unwrap())
                }
                // Every read completion is accounted on the lifecycle
                // object, so a failing sector cannot get lost.
                Direction::Read => {
                    io.inc_pending();
                    CipherToken::Read(io.clone())
                }
            }
        } else {
            CipherToken::None
        };

        if let Err(e) = convert_sector(cc, sg_out, sg_in, ctx.dir, ctx.sector, token) {
            log::error!("conversion failed at sector {}: {}", ctx.sector, e);
            ret = Err(e);
            break;
        }

        ctx.sector += 1;
    }

    if let Some(barrier) = barrier {
        let r = barrier.wait(submitted, WRITE_TIMEOUT);
        if r < 0 {
            return Err(r);
        }
    }

    ret
}

/// Build an unfragmented clone of up to `size` bytes from the page pool.
/// The first [`MIN_BIO_PAGES`] pages may block; beyond that pages are
/// taken non-blocking, so a short clone is returned instead of sleeping
/// and the caller re-enters once this one is submitted.
fn crypt_alloc_buffer(cc: &CryptConfig, size: usize) -> Option<Bio> {
    let nr_pages = size.div_ceil(PAGE_SIZE);
    let mut clone = Bio::new(Direction::Write, 0);
    let mut remaining = size;

    for i in 0..nr_pages {
        let page = if i < MIN_BIO_PAGES {
            cc.page_pool.alloc()
        } else {
            match cc.page_pool.try_alloc() {
                Some(page) => page,
                None => break,
            }
        };

        let len = remaining.min(PAGE_SIZE);
        clone.push(BioVec {
            page,
            offset: 0,
            len,
        });
        remaining -= len;
    }

    if clone.size() == 0 {
        return None;
    }
    Some(clone)
}

/// Completion of a clone submitted to the backing device. Runs in the
/// device's completion context, so reads are re-queued to the worker
/// instead of decrypting here.
fn crypt_endio(io: Arc<CryptIo>, dir: Direction, error: i32) {
    match dir {
        // Processed pages travel back to the pool as the clone drops,
        // even for a partially completed write.
        Direction::Write => dec_pending(&io, error),
        Direction::Read => {
            if error < 0 {
                dec_pending(&io, error);
                return;
            }
            io.post_process.store(true, Ordering::SeqCst);
            let queue = io.cc.queue.clone();
            queue.queue_io(io);
        }
    }
}

fn clone_init(io: &Arc<CryptIo>, clone: &mut Bio) {
    let io = io.clone();
    clone.set_end_io(Box::new(move |bio, error| {
        crypt_endio(io, bio.dir(), error)
    }));
}

fn process_write(io: Arc<CryptIo>) {
    let cc = io.cc.clone();
    let (in_segs, base_sector, total, _) = io.base_info();
    let mut sector = base_sector - cc.begin;

    io.inc_pending();
    let mut ctx = ConvertContext::new(&cc, in_segs, Vec::new(), sector, Direction::Write);

    // The allocated buffers can be smaller than the whole bio, so repeat
    // until all the data is handled.
    let mut remaining = total;
    while remaining > 0 {
        let Some(mut clone) = crypt_alloc_buffer(&cc, remaining) else {
            dec_pending(&io, -libc::ENOMEM);
            return;
        };

        ctx.set_out(clone.segs().to_vec());
        if crypt_convert(&cc, &mut ctx, &io).is_err() {
            drop(clone);
            dec_pending(&io, -libc::EIO);
            return;
        }
        // The conversion must have filled the clone completely.
        debug_assert!(ctx.out_done());

        clone.set_sector(cc.start + sector);
        remaining -= clone.size();
        sector += clone.sectors();

        // Another reference before the request is kicked off, so the io
        // outlives every submitted clone.
        if remaining > 0 {
            io.inc_pending();
        }

        clone_init(&io, &mut clone);
        log::trace!(
            "submitting write clone at sector {} ({} bytes, {} left)",
            clone.sector(),
            clone.size(),
            remaining
        );
        cc.dev.submit(clone);

        // Allocation was tight; give in-flight clones a moment to return
        // their pages.
        if remaining > 0 {
            thread::sleep(Duration::from_millis(10));
        }
    }
}

fn process_read(io: Arc<CryptIo>) {
    let cc = io.cc.clone();
    let (segs, base_sector, size, _) = io.base_info();

    io.inc_pending();

    // The clone shares the original pages: ciphertext is fetched into
    // them and decrypted in place afterwards.
    let mut clone = Bio::with_segs(Direction::Read, cc.start + (base_sector - cc.begin), segs);
    clone_init(&io, &mut clone);
    log::trace!(
        "submitting read clone at sector {} ({} bytes)",
        clone.sector(),
        size
    );
    cc.dev.submit(clone);
}

fn process_read_endio(io: Arc<CryptIo>) {
    let cc = io.cc.clone();
    let (segs, base_sector, _, _) = io.base_info();

    let mut ctx = ConvertContext::new(
        &cc,
        segs.clone(),
        segs,
        base_sector - cc.begin,
        Direction::Read,
    );
    let r = crypt_convert(&cc, &mut ctx, &io);
    dec_pending(&io, r.err().unwrap_or(0));
}

/// Substitute low pool pages for every page the cipher backend cannot
/// address. Writes stage their plaintext into the substitutes right away;
/// reads copy back when the request completes.
fn build_bounce(cc: &CryptConfig, orig: Bio) -> (Bio, Bio) {
    let mut segs = Vec::with_capacity(orig.seg_count());
    for seg in orig.segs() {
        if !seg.page.is_high() {
            segs.push(seg.clone());
            continue;
        }

        debug_assert!(seg.offset + seg.len <= PAGE_SIZE);
        let low = cc.page_pool.alloc();
        if orig.dir() == Direction::Write {
            unsafe {
                low.bytes_mut(seg.offset, seg.len)
                    .copy_from_slice(seg.page.bytes(seg.offset, seg.len));
            }
        }
        segs.push(BioVec {
            page: low,
            offset: seg.offset,
            len: seg.len,
        });
    }

    let bounced = Bio::with_segs(orig.dir(), orig.sector(), segs);
    (bounced, orig)
}

/// Reverse the substitution: copy decrypted data back on reads, then let
/// the bounced pages return to the pool. Original pages only ever lose a
/// reference here.
fn finish_bounce(bounced: Bio, orig: Bio, error: i32) {
    if orig.dir() == Direction::Read {
        for (from, to) in bounced.segs().iter().zip(orig.segs()) {
            if Arc::ptr_eq(&from.page, &to.page) {
                // Page was not bounced.
                continue;
            }
            unsafe {
                to.page
                    .bytes_mut(to.offset, to.len)
                    .copy_from_slice(from.page.bytes(from.offset, from.len));
            }
        }
    }

    drop(bounced);
    orig.complete(error);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blkdev::RamDisk;
    use crate::cipher::{CryptBackend, OffloadEngine};
    use crate::ctrl::CryptTargetBuilder;
    use crate::test_helpers::{read_sectors, write_sectors};

    fn offload_backend() -> (Arc<OffloadEngine>, CryptBackend) {
        let engine = Arc::new(OffloadEngine::new(2, 8));
        (engine.clone(), CryptBackend::Offload(engine))
    }

    #[test]
    fn test_offload_round_trip() {
        let disk = Arc::new(RamDisk::new("ram0", 256));
        let (_engine, backend) = offload_backend();
        let key = "ab".repeat(32);
        let tgt = CryptTargetBuilder::default()
            .cipher("aes-cbc-essiv:sha256")
            .key(&key)
            .backend(backend)
            .build(disk.clone())
            .unwrap();

        let data = vec![0x6du8; 4 * PAGE_SIZE];
        assert_eq!(write_sectors(&tgt, 16, &data), 0);

        let (err, back) = read_sectors(&tgt, 16, data.len());
        assert_eq!(err, 0);
        assert_eq!(back, data);

        // What hit the media must not be the plaintext.
        assert_ne!(disk.sector_data(16, 8), data[..8 * SECTOR_SIZE].to_vec());
    }

    #[test]
    fn test_offload_write_failure_completes_with_error() {
        let disk = Arc::new(RamDisk::new("ram0", 256));
        let (engine, backend) = offload_backend();
        let key = "00".repeat(16);
        let tgt = CryptTargetBuilder::default()
            .cipher("aes-cbc-plain")
            .key(&key)
            .backend(backend)
            .build(disk)
            .unwrap();

        // Fail the third sector in the backend; the bio must still
        // complete, with a non-zero error, well within the barrier bound.
        engine.set_fault_hook(|sector| sector == 2);

        let start = std::time::Instant::now();
        let err = write_sectors(&tgt, 0, &vec![0u8; 8 * SECTOR_SIZE]);
        assert_eq!(err, -libc::EIO);
        assert!(start.elapsed() < Duration::from_secs(30));
    }

    #[test]
    fn test_offload_read_failure_latches_on_io() {
        let disk = Arc::new(RamDisk::new("ram0", 256));
        let (engine, backend) = offload_backend();
        let key = "00".repeat(16);
        let tgt = CryptTargetBuilder::default()
            .cipher("aes-cbc-plain")
            .key(&key)
            .backend(backend)
            .build(disk)
            .unwrap();

        assert_eq!(write_sectors(&tgt, 0, &vec![0x11u8; 4 * SECTOR_SIZE]), 0);

        engine.set_fault_hook(|sector| sector == 1);
        let (err, _) = read_sectors(&tgt, 0, 4 * SECTOR_SIZE);
        assert_eq!(err, -libc::EIO);
    }

    #[test]
    fn test_lower_device_read_error_latches() {
        let disk = Arc::new(RamDisk::new("ram0", 256));
        let key = "00".repeat(16);
        let tgt = CryptTargetBuilder::default()
            .cipher("aes-cbc-plain")
            .key(&key)
            .build(disk.clone())
            .unwrap();

        assert_eq!(write_sectors(&tgt, 0, &vec![0x11u8; SECTOR_SIZE]), 0);

        disk.inject_error(-libc::EIO);
        let (err, _) = read_sectors(&tgt, 0, SECTOR_SIZE);
        assert_eq!(err, -libc::EIO);
    }

    #[test]
    fn test_bounce_round_trip_on_constrained_backend() {
        use crate::bio::{Bio, BioVec, Page};
        use crate::test_helpers::wait_bio;

        let disk = Arc::new(RamDisk::new("ram0", 256));
        let (_engine, backend) = offload_backend();
        let key = "5a".repeat(32);
        let tgt = CryptTargetBuilder::default()
            .cipher("aes-cbc-essiv:sha256")
            .key(&key)
            .backend(backend)
            .build(disk)
            .unwrap();

        let high_page = |fill: u8| {
            let mut page = Page::new(PAGE_SIZE);
            page.fill(fill);
            page.mark_high();
            Arc::new(page)
        };

        let wpage = high_page(0x3c);
        let (wbio, wrx) = {
            let mut bio = Bio::with_segs(
                Direction::Write,
                4,
                vec![BioVec {
                    page: wpage.clone(),
                    offset: 0,
                    len: PAGE_SIZE,
                }],
            );
            let (tx, rx) = std::sync::mpsc::channel();
            bio.set_end_io(Box::new(move |_, e| tx.send(e).unwrap()));
            (bio, rx)
        };
        tgt.map(wbio);
        assert_eq!(wait_bio(&wrx), 0);
        // The submitter's page still holds the plaintext.
        assert_eq!(unsafe { wpage.bytes(0, 16) }, &[0x3cu8; 16]);

        let rpage = high_page(0);
        let (rbio, rrx) = {
            let mut bio = Bio::with_segs(
                Direction::Read,
                4,
                vec![BioVec {
                    page: rpage.clone(),
                    offset: 0,
                    len: PAGE_SIZE,
                }],
            );
            let (tx, rx) = std::sync::mpsc::channel();
            bio.set_end_io(Box::new(move |_, e| tx.send(e).unwrap()));
            (bio, rx)
        };
        tgt.map(rbio);
        assert_eq!(wait_bio(&rrx), 0);
        assert_eq!(
            unsafe { rpage.bytes(0, PAGE_SIZE) },
            &[0x3cu8; PAGE_SIZE][..]
        );
    }
}
