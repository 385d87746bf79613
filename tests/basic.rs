#[cfg(test)]
mod tests {
    use std::sync::mpsc::Receiver;
    use std::sync::Arc;
    use std::time::Duration;

    use cryptblk::blkdev::{BlockDevice, FileDevice, RamDisk};
    use cryptblk::{
        Bio, BioVec, CryptBackend, CryptFlags, CryptTarget, CryptTargetBuilder, Direction,
        OffloadEngine, Page, StatusType, PAGE_SIZE, SECTOR_SIZE,
    };

    fn make_bio(dir: Direction, sector: u64, len: usize) -> (Bio, Vec<Arc<Page>>, Receiver<i32>) {
        assert!(len % SECTOR_SIZE == 0);

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
        let (tx, rx) = std::sync::mpsc::channel();
        bio.set_end_io(Box::new(move |_, error| {
            let _ = tx.send(error);
        }));
        (bio, pages, rx)
    }

    fn wait_bio(rx: &Receiver<i32>) -> i32 {
        rx.recv_timeout(Duration::from_secs(60))
            .expect("bio did not complete")
    }

    fn write_sectors(tgt: &CryptTarget, sector: u64, data: &[u8]) -> i32 {
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

    fn read_sectors(tgt: &CryptTarget, sector: u64, len: usize) -> (i32, Vec<u8>) {
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

    fn ram_target(spec: &str, key: &str, disk: &Arc<RamDisk>) -> CryptTarget {
        CryptTargetBuilder::default()
            .cipher(spec)
            .key(key)
            .build(disk.clone())
            .unwrap()
    }

    #[test]
    fn test_essiv_round_trip() {
        let disk = Arc::new(RamDisk::new("ram0", 1024));
        let key = "00".repeat(32);
        let tgt = ram_target("aes-cbc-essiv:sha256", &key, &disk);

        let data = vec![0x41u8; 4096];
        assert_eq!(write_sectors(&tgt, 8, &data), 0);

        let (err, back) = read_sectors(&tgt, 8, 4096);
        assert_eq!(err, 0);
        assert_eq!(back, data);

        // The ciphertext on the backing device must not be the plaintext.
        assert_ne!(disk.sector_data(8, 8), data);
    }

    #[test]
    fn test_per_sector_iv_independence() {
        let disk = Arc::new(RamDisk::new("ram0", 64));
        let key = "00".repeat(32);
        let tgt = ram_target("aes-cbc-plain", &key, &disk);

        let zeros = vec![0u8; SECTOR_SIZE];
        assert_eq!(write_sectors(&tgt, 0, &zeros), 0);
        assert_eq!(write_sectors(&tgt, 1, &zeros), 0);

        assert_ne!(disk.sector_data(0, 1), disk.sector_data(1, 1));
    }

    #[test]
    fn test_null_iv_yields_identical_ciphertext() {
        let disk = Arc::new(RamDisk::new("ram0", 64));
        let key = "10".repeat(32);
        let tgt = ram_target("aes-cbc-null", &key, &disk);

        let data = vec![0x77u8; SECTOR_SIZE];
        assert_eq!(write_sectors(&tgt, 0, &data), 0);
        assert_eq!(write_sectors(&tgt, 42, &data), 0);

        // Diagnostic compatibility property of the null IV.
        assert_eq!(disk.sector_data(0, 1), disk.sector_data(42, 1));
    }

    #[test]
    fn test_benbi_round_trip() {
        let disk = Arc::new(RamDisk::new("ram0", 64));
        let key = "a5".repeat(16);
        let tgt = ram_target("aes-cbc-benbi", &key, &disk);

        let data: Vec<u8> = (0..2 * SECTOR_SIZE).map(|i| i as u8).collect();
        assert_eq!(write_sectors(&tgt, 3, &data), 0);
        let (err, back) = read_sectors(&tgt, 3, data.len());
        assert_eq!(err, 0);
        assert_eq!(back, data);
    }

    #[test]
    fn test_iv_offset_changes_the_mapping() {
        let disk = Arc::new(RamDisk::new("ram0", 64));
        let key = "42".repeat(32);

        let a = ram_target("aes-cbc-plain", &key, &disk);
        let data: Vec<u8> = (0..SECTOR_SIZE).map(|i| (i * 7) as u8).collect();
        assert_eq!(write_sectors(&a, 5, &data), 0);

        let b = CryptTargetBuilder::default()
            .cipher("aes-cbc-plain")
            .key(&key)
            .iv_offset(1000)
            .build(disk.clone())
            .unwrap();
        let (err, back) = read_sectors(&b, 5, SECTOR_SIZE);
        assert_eq!(err, 0);
        assert_ne!(back, data);

        // The correctly configured target still reads it fine.
        let (err, back) = read_sectors(&a, 5, SECTOR_SIZE);
        assert_eq!(err, 0);
        assert_eq!(back, data);
    }

    #[test]
    fn test_key_wipe_blocks_resume() {
        let disk = Arc::new(RamDisk::new("ram0", 64));
        let key = "07".repeat(32);
        let tgt = ram_target("aes-cbc-essiv:sha256", &key, &disk);

        tgt.postsuspend();
        tgt.message(&["key", "wipe"]).unwrap();
        assert_eq!(tgt.preresume().unwrap_err().errno(), -libc::EAGAIN);
        assert!(!tgt.flags().contains(CryptFlags::KEY_VALID));
    }

    #[test]
    fn test_short_clone_writes_under_pool_pressure() {
        let disk = Arc::new(RamDisk::new("ram0", 2048));
        let key = "00".repeat(32);
        let tgt = CryptTargetBuilder::default()
            .cipher("aes-cbc-plain")
            .key(&key)
            .pool_pages(8)
            .build(disk.clone())
            .unwrap();

        // 64 pages of payload against an 8-page reserve: the write must
        // split into short clones and still succeed.
        let data: Vec<u8> = (0..64 * PAGE_SIZE).map(|i| (i % 251) as u8).collect();
        assert_eq!(write_sectors(&tgt, 0, &data), 0);
        assert!(disk.submitted() >= 8, "got {} clones", disk.submitted());

        let (err, back) = read_sectors(&tgt, 0, data.len());
        assert_eq!(err, 0);
        assert_eq!(back, data);
    }

    #[test]
    fn test_table_line_construction_and_status() {
        let disk = Arc::new(RamDisk::new("ram0", 128));
        let line = format!("aes-cbc-essiv:sha256 {} 0 ram0 0", "0a".repeat(32));
        let tgt = CryptTarget::from_table(&line, |name| {
            (name == "ram0").then(|| disk.clone() as Arc<dyn BlockDevice>)
        })
        .unwrap();

        assert_eq!(tgt.status(StatusType::Table), line);
        assert_eq!(tgt.status(StatusType::Info), "");

        let data = vec![0xabu8; SECTOR_SIZE];
        assert_eq!(write_sectors(&tgt, 0, &data), 0);
        let (err, back) = read_sectors(&tgt, 0, SECTOR_SIZE);
        assert_eq!(err, 0);
        assert_eq!(back, data);
    }

    #[test]
    fn test_start_offset_places_data_on_the_device() {
        let disk = Arc::new(RamDisk::new("ram0", 256));
        let key = "33".repeat(32);
        let tgt = CryptTargetBuilder::default()
            .cipher("aes-cbc-plain")
            .key(&key)
            .start(100)
            .build(disk.clone())
            .unwrap();

        let data = vec![0x5eu8; SECTOR_SIZE];
        assert_eq!(write_sectors(&tgt, 2, &data), 0);

        // Logical sector 2 lands at device sector 102.
        assert_eq!(disk.sector_data(0, 1), vec![0u8; SECTOR_SIZE]);
        assert_ne!(disk.sector_data(102, 1), vec![0u8; SECTOR_SIZE]);
        let (err, back) = read_sectors(&tgt, 2, SECTOR_SIZE);
        assert_eq!(err, 0);
        assert_eq!(back, data);
    }

    #[test]
    fn test_different_keys_do_not_decrypt() {
        let disk = Arc::new(RamDisk::new("ram0", 64));
        let key_a = "11".repeat(32);
        let key_b = "22".repeat(32);

        let data = vec![0x60u8; SECTOR_SIZE];
        {
            let a = ram_target("aes-cbc-essiv:sha256", &key_a, &disk);
            assert_eq!(write_sectors(&a, 0, &data), 0);
        }

        let b = ram_target("aes-cbc-essiv:sha256", &key_b, &disk);
        let (err, back) = read_sectors(&b, 0, SECTOR_SIZE);
        assert_eq!(err, 0);
        assert_ne!(back, data);
    }

    #[test]
    fn test_offload_backend_round_trip() {
        let disk = Arc::new(RamDisk::new("ram0", 512));
        let engine = Arc::new(OffloadEngine::new(2, 16));
        let key = "9d".repeat(32);
        let tgt = CryptTargetBuilder::default()
            .cipher("aes-cbc-essiv:sha256")
            .key(&key)
            .backend(CryptBackend::Offload(engine))
            .build(disk.clone())
            .unwrap();

        let data: Vec<u8> = (0..8 * PAGE_SIZE).map(|i| (i % 253) as u8).collect();
        assert_eq!(write_sectors(&tgt, 32, &data), 0);
        let (err, back) = read_sectors(&tgt, 32, data.len());
        assert_eq!(err, 0);
        assert_eq!(back, data);
        assert_ne!(
            disk.sector_data(32, data.len() / SECTOR_SIZE),
            data,
            "offload ciphertext must differ from plaintext"
        );
    }

    #[test]
    fn test_sync_and_offload_backends_produce_the_same_ciphertext() {
        let key = "77".repeat(32);
        let data: Vec<u8> = (0..4 * SECTOR_SIZE).map(|i| (i % 131) as u8).collect();

        let disk_a = Arc::new(RamDisk::new("ram0", 64));
        let sync = ram_target("aes-cbc-essiv:sha256", &key, &disk_a);
        assert_eq!(write_sectors(&sync, 0, &data), 0);

        let disk_b = Arc::new(RamDisk::new("ram1", 64));
        let engine = Arc::new(OffloadEngine::new(1, 4));
        let offload = CryptTargetBuilder::default()
            .cipher("aes-cbc-essiv:sha256")
            .key(&key)
            .backend(CryptBackend::Offload(engine))
            .build(disk_b.clone())
            .unwrap();
        assert_eq!(write_sectors(&offload, 0, &data), 0);

        assert_eq!(disk_a.sector_data(0, 4), disk_b.sector_data(0, 4));
    }

    #[test]
    fn test_file_backed_target_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backing.img");
        std::fs::write(&path, vec![0u8; 256 * SECTOR_SIZE]).unwrap();

        let dev = Arc::new(FileDevice::open(&path).unwrap());
        let key = "c3".repeat(32);
        let tgt = CryptTargetBuilder::default()
            .cipher("aes-cbc-essiv:sha256")
            .key(&key)
            .build(dev)
            .unwrap();

        let data = vec![0x2fu8; 2 * PAGE_SIZE];
        assert_eq!(write_sectors(&tgt, 16, &data), 0);
        let (err, back) = read_sectors(&tgt, 16, data.len());
        assert_eq!(err, 0);
        assert_eq!(back, data);

        // On-disk bytes are ciphertext.
        let raw = std::fs::read(&path).unwrap();
        assert_ne!(&raw[16 * SECTOR_SIZE..16 * SECTOR_SIZE + data.len()], &data[..]);
    }

    #[test]
    fn test_des_cipher_round_trip() {
        let disk = Arc::new(RamDisk::new("ram0", 64));
        let key = "1c".repeat(8);
        let tgt = ram_target("des-cbc-plain", &key, &disk);

        let data = vec![0x91u8; SECTOR_SIZE];
        assert_eq!(write_sectors(&tgt, 1, &data), 0);
        let (err, back) = read_sectors(&tgt, 1, SECTOR_SIZE);
        assert_eq!(err, 0);
        assert_eq!(back, data);
    }

    #[test]
    fn test_construction_failure_is_clean() {
        let disk = Arc::new(RamDisk::new("ram0", 64));
        let key = "00".repeat(32);

        // Unknown digest and an undigestible salt both fail construction
        // with EINVAL and release everything they allocated.
        for spec in ["aes-cbc-essiv:whirlpool0", "aes-cbc-essiv:sha384"] {
            let err = CryptTargetBuilder::default()
                .cipher(spec)
                .key(&key)
                .build(disk.clone())
                .unwrap_err();
            assert_eq!(err.errno(), -libc::EINVAL, "spec {}", spec);
        }

        // The device is still usable by a valid target afterwards.
        let tgt = ram_target("aes-cbc-essiv:sha256", &key, &disk);
        assert_eq!(write_sectors(&tgt, 0, &vec![1u8; SECTOR_SIZE]), 0);
    }
}
