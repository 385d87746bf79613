//! Backing block devices. The block layer that delivers upper-level
//! requests and dispatches completions is an external collaborator; this
//! module only defines the lower edge a crypt target submits its clones to,
//! plus two stock implementations.

use std::fs::File;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::bio::{Bio, Direction};
use crate::{SECTOR_SHIFT, SECTOR_SIZE};

/// A backing device. `submit` takes ownership of the bio and must complete
/// it exactly once, possibly from another thread; completion hooks may run
/// in the device's completion context and therefore must not perform
/// cryptography inline.
pub trait BlockDevice: Send + Sync {
    fn name(&self) -> &str;

    fn sectors(&self) -> u64;

    fn submit(&self, bio: Bio);
}

/// Memory-backed device, mainly for tests and demos. Completes bios
/// inline on the submitting thread.
pub struct RamDisk {
    name: String,
    data: Mutex<Vec<u8>>,
    submitted: AtomicUsize,
    inject: Mutex<Option<i32>>,
}

impl RamDisk {
    pub fn new(name: &str, sectors: u64) -> Self {
        RamDisk {
            name: name.to_string(),
            data: Mutex::new(vec![0u8; (sectors as usize) << SECTOR_SHIFT]),
            submitted: AtomicUsize::new(0),
            inject: Mutex::new(None),
        }
    }

    /// Number of bios submitted so far.
    pub fn submitted(&self) -> usize {
        self.submitted.load(Ordering::Relaxed)
    }

    /// Fail the next submitted bio with the given negative errno.
    pub fn inject_error(&self, error: i32) {
        *self.inject.lock().unwrap() = Some(error);
    }

    /// Raw device content at the given sector range, for inspecting what
    /// actually hit the media.
    pub fn sector_data(&self, sector: u64, count: usize) -> Vec<u8> {
        let off = (sector as usize) << SECTOR_SHIFT;
        self.data.lock().unwrap()[off..off + count * SECTOR_SIZE].to_vec()
    }
}

impl BlockDevice for RamDisk {
    fn name(&self) -> &str {
        &self.name
    }

    fn sectors(&self) -> u64 {
        (self.data.lock().unwrap().len() >> SECTOR_SHIFT) as u64
    }

    fn submit(&self, bio: Bio) {
        self.submitted.fetch_add(1, Ordering::Relaxed);

        if let Some(err) = self.inject.lock().unwrap().take() {
            bio.complete(err);
            return;
        }

        let start = (bio.sector() as usize) << SECTOR_SHIFT;
        let mut data = self.data.lock().unwrap();
        if start + bio.size() > data.len() {
            drop(data);
            bio.complete(-libc::EIO);
            return;
        }

        // The caller guarantees exclusive access to the bio's pages for the
        // duration of the request, see `Page`.
        unsafe {
            match bio.dir() {
                Direction::Read => bio.write_payload(&data[start..start + bio.size()]),
                Direction::Write => bio.read_payload(&mut data[start..start + bio.size()]),
            }
        }
        drop(data);

        bio.complete(0);
    }
}

/// File-backed device using positioned reads/writes.
pub struct FileDevice {
    name: String,
    file: File,
    sectors: u64,
}

impl FileDevice {
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = File::options().read(true).write(true).open(&path)?;
        let sectors = file.metadata()?.len() >> SECTOR_SHIFT;
        Ok(FileDevice {
            name: path.as_ref().display().to_string(),
            file,
            sectors,
        })
    }
}

impl BlockDevice for FileDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn sectors(&self) -> u64 {
        self.sectors
    }

    fn submit(&self, bio: Bio) {
        use std::os::unix::fs::FileExt;

        let mut off = bio.sector() << SECTOR_SHIFT;
        for seg in bio.segs() {
            // Exclusive segment access per the bio protocol.
            let res = unsafe {
                match bio.dir() {
                    Direction::Read => self
                        .file
                        .read_exact_at(seg.page.bytes_mut(seg.offset, seg.len), off),
                    Direction::Write => self
                        .file
                        .write_all_at(seg.page.bytes(seg.offset, seg.len), off),
                }
            };
            if let Err(err) = res {
                log::error!("{}: io failed at offset {}: {}", self.name, off, err);
                bio.complete(-err.raw_os_error().unwrap_or(libc::EIO));
                return;
            }
            off += seg.len as u64;
        }

        bio.complete(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bio::BioVec;
    use std::sync::Arc;

    fn one_page_bio(dir: Direction, sector: u64, fill: u8) -> (Bio, Arc<crate::bio::Page>) {
        let mut page = crate::bio::Page::new(crate::PAGE_SIZE);
        page.fill(fill);
        let page = Arc::new(page);
        let bio = Bio::with_segs(
            dir,
            sector,
            vec![BioVec {
                page: page.clone(),
                offset: 0,
                len: crate::PAGE_SIZE,
            }],
        );
        (bio, page)
    }

    #[test]
    fn test_ramdisk_round_trip() {
        let disk = RamDisk::new("ram0", 64);
        let (wbio, _wp) = one_page_bio(Direction::Write, 8, 0x42);
        disk.submit(wbio);
        assert_eq!(disk.sector_data(8, 1), vec![0x42u8; SECTOR_SIZE]);

        let (rbio, rp) = one_page_bio(Direction::Read, 8, 0);
        disk.submit(rbio);
        assert_eq!(unsafe { rp.bytes(0, SECTOR_SIZE) }, &[0x42u8; SECTOR_SIZE]);
    }

    #[test]
    fn test_ramdisk_out_of_range() {
        let disk = RamDisk::new("ram0", 4);
        let (mut bio, _p) = one_page_bio(Direction::Write, 2, 0);
        let (tx, rx) = std::sync::mpsc::channel();
        bio.set_end_io(Box::new(move |_, err| tx.send(err).unwrap()));
        disk.submit(bio);
        assert_eq!(rx.recv().unwrap(), -libc::EIO);
    }

    #[test]
    fn test_file_device_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backing.img");
        std::fs::write(&path, vec![0u8; 64 * SECTOR_SIZE]).unwrap();

        let dev = FileDevice::open(&path).unwrap();
        assert_eq!(dev.sectors(), 64);

        let (wbio, _wp) = one_page_bio(Direction::Write, 0, 0x99);
        dev.submit(wbio);
        let (rbio, rp) = one_page_bio(Direction::Read, 0, 0);
        dev.submit(rbio);
        assert_eq!(unsafe { rp.bytes(0, 16) }, &[0x99u8; 16]);
    }
}
