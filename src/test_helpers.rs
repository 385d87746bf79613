#![cfg(test)]

//! Shared unit-test utilities: building page-backed bios and driving a
//! target synchronously from test code.

use std::sync::mpsc::{Receiver, Sender};
use std::sync::Arc;
use std::time::Duration;

use crate::bio::{Bio, BioVec, Direction, Page};
use crate::ctrl::CryptTarget;
use crate::PAGE_SIZE;

#[ctor::ctor]
fn init_logger() {
    let _ = env_logger::builder()
        .format_target(false)
        .format_timestamp(None)
        .is_test(true)
        .try_init();
}

/// Build a bio carrying `len` bytes over page-sized segments, returning
/// the pages for later inspection and a channel the completion reports to.
pub(crate) fn make_bio(
    dir: Direction,
    sector: u64,
    len: usize,
) -> (Bio, Vec<Arc<Page>>, Receiver<i32>) {
    assert!(len % crate::SECTOR_SIZE == 0);

    let mut pages = Vec::new();
    let mut segs = Vec::new();
    let mut remaining = len;
    while remaining > 0 {
        let seg_len = remaining.min(PAGE_SIZE);
        let page = Arc::new(Page::new(PAGE_SIZE));
        segs.push(BioVec {
            page: page.clone(),
            offset: 0,
            len: seg_len,
        });
        pages.push(page);
        remaining -= seg_len;
    }

    let mut bio = Bio::with_segs(dir, sector, segs);
    let (tx, rx): (Sender<i32>, Receiver<i32>) = std::sync::mpsc::channel();
    bio.set_end_io(Box::new(move |_, error| {
        let _ = tx.send(error);
    }));
    (bio, pages, rx)
}

pub(crate) fn wait_bio(rx: &Receiver<i32>) -> i32 {
    rx.recv_timeout(Duration::from_secs(60))
        .expect("bio did not complete")
}

/// Write `data` at `sector` through the target and wait for completion.
pub(crate) fn write_sectors(tgt: &CryptTarget, sector: u64, data: &[u8]) -> i32 {
    let (bio, pages, rx) = make_bio(Direction::Write, sector, data.len());
    let mut done = 0;
    for (i, page) in pages.iter().enumerate() {
        let seg_len = bio.segs()[i].len;
        unsafe {
            page.bytes_mut(0, seg_len)
                .copy_from_slice(&data[done..done + seg_len]);
        }
        done += seg_len;
    }

    tgt.map(bio);
    wait_bio(&rx)
}

/// Read `len` bytes at `sector` through the target, returning the
/// completion status and the data.
pub(crate) fn read_sectors(tgt: &CryptTarget, sector: u64, len: usize) -> (i32, Vec<u8>) {
    let (bio, pages, rx) = make_bio(Direction::Read, sector, len);
    let seg_lens: Vec<usize> = bio.segs().iter().map(|s| s.len).collect();

    tgt.map(bio);
    let err = wait_bio(&rx);

    let mut out = Vec::with_capacity(len);
    for (page, seg_len) in pages.iter().zip(seg_lens) {
        out.extend_from_slice(unsafe { page.bytes(0, seg_len) });
    }
    (err, out)
}
