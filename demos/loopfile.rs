//! File-backed encrypted device demo.
//!
//! Creates (or reuses) a backing image, builds a crypt target on top of it
//! and round-trips a pattern through the encrypted view:
//!
//! ```text
//! cargo run --example loopfile -- /tmp/crypt.img --size-mb 4
//! ```

use std::sync::mpsc::channel;
use std::sync::Arc;

use clap::Parser;

use cryptblk::blkdev::FileDevice;
use cryptblk::{
    Bio, BioVec, CryptTargetBuilder, Direction, Page, StatusType, PAGE_SIZE, SECTOR_SIZE,
};

#[derive(Parser)]
#[command(about = "round-trip data through a file-backed crypt target")]
struct Args {
    /// backing image path; created when missing
    image: std::path::PathBuf,

    /// backing image size in MiB when creating it
    #[arg(long, default_value_t = 4)]
    size_mb: u64,

    /// cipher spec
    #[arg(long, default_value = "aes-cbc-essiv:sha256")]
    cipher: String,

    /// hex key
    #[arg(long, default_value_t = String::from("00").repeat(32))]
    key: String,

    /// sector to write at
    #[arg(long, default_value_t = 8)]
    sector: u64,
}

fn run_bio(tgt: &cryptblk::CryptTarget, dir: Direction, sector: u64, page: &Arc<Page>) -> i32 {
    let mut bio = Bio::with_segs(
        dir,
        sector,
        vec![BioVec {
            page: page.clone(),
            offset: 0,
            len: PAGE_SIZE,
        }],
    );
    let (tx, rx) = channel();
    bio.set_end_io(Box::new(move |_, err| {
        let _ = tx.send(err);
    }));
    tgt.map(bio);
    rx.recv().expect("bio lost")
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    if !args.image.exists() {
        std::fs::write(&args.image, vec![0u8; (args.size_mb << 20) as usize])?;
    }
    let dev = Arc::new(FileDevice::open(&args.image)?);

    let tgt = CryptTargetBuilder::default()
        .cipher(&args.cipher)
        .key(&args.key)
        .build(dev)
        .map_err(|e| anyhow::anyhow!("target construction failed: {e}"))?;
    println!("table:  {}", tgt.status(StatusType::Table));
    println!("params: {}", tgt.dump_json());

    let mut page = Page::new(PAGE_SIZE);
    for (i, chunk) in (0u8..).zip((0..PAGE_SIZE).step_by(SECTOR_SIZE)) {
        let pattern = vec![i.wrapping_mul(29); SECTOR_SIZE];
        page.copy_from(chunk, &pattern);
    }
    let wpage = Arc::new(page);

    let err = run_bio(&tgt, Direction::Write, args.sector, &wpage);
    anyhow::ensure!(err == 0, "write failed: {err}");

    let rpage = Arc::new(Page::new(PAGE_SIZE));
    let err = run_bio(&tgt, Direction::Read, args.sector, &rpage);
    anyhow::ensure!(err == 0, "read failed: {err}");

    let same = unsafe { wpage.bytes(0, PAGE_SIZE) == rpage.bytes(0, PAGE_SIZE) };
    anyhow::ensure!(same, "decrypted data does not match what was written");

    println!(
        "round-tripped {} bytes at sector {} through {}",
        PAGE_SIZE, args.sector, args.cipher
    );
    Ok(())
}
