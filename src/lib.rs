//! # cryptblk
//!
//! A library for building transparent block-level encryption targets in
//! userspace. A target sits between an upper block-I/O submitter and a
//! backing [`BlockDevice`](blkdev::BlockDevice): every sector written
//! through it is encrypted before it reaches the backing device, and every
//! sector read back is decrypted in place before the submitter sees it.
//!
//! Encryption is keyed per target and per sector: the initialization
//! vector for a sector is derived from its sector number, so sectors can
//! be rewritten in place without any on-disk metadata.
//!
//! ## Key components
//!
//! - **Target**: [`ctrl::CryptTarget`], built from the classic five-field
//!   table line `<cipher-spec> <key-hex> <iv-offset> <device> <start>` or
//!   via [`ctrl::CryptTargetBuilder`].
//! - **Data path**: per-bio lifecycle objects and the sector-by-sector
//!   conversion engine in [`io`], driven from a named worker queue
//!   ([`queue::CryptQueue`]) so cryptography never runs in a completion
//!   context.
//! - **Cipher backends**: a synchronous in-process backend and a
//!   session-based offload backend ([`cipher::OffloadEngine`]) whose
//!   completions arrive via callback.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use cryptblk::blkdev::RamDisk;
//! use cryptblk::ctrl::CryptTarget;
//!
//! fn example() -> Result<(), cryptblk::CryptError> {
//!     let disk = Arc::new(RamDisk::new("ram0", 1 << 20));
//!     let tgt = CryptTarget::from_table(
//!         "aes-cbc-essiv:sha256 \
//!          000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f \
//!          0 ram0 0",
//!         |name| (name == "ram0").then(|| disk.clone() as _),
//!     )?;
//!     println!("{}", tgt.status(cryptblk::ctrl::StatusType::Table));
//!     Ok(())
//! }
//! ```

pub mod bio;
pub mod blkdev;
pub mod cipher;
pub mod ctrl;
pub mod helpers;
pub mod io;
pub mod iv;
pub mod pool;
pub mod queue;

#[cfg(test)]
mod test_helpers;

/// Shift of the fixed 512-byte sector, the unit of addressing and of every
/// cryptographic operation.
pub const SECTOR_SHIFT: u32 = 9;
pub const SECTOR_SIZE: usize = 1 << SECTOR_SHIFT;

/// Data pages handled by the buffer pools.
pub const PAGE_SIZE: usize = 4096;

/// Reserved per-bio lifecycle objects per target.
pub const MIN_IOS: usize = 256;

/// Reserved data pages per target for write cloning and bouncing.
pub const MIN_POOL_PAGES: usize = 32;

/// Leading pages of a write clone that may block on the page pool; pages
/// beyond this are allocated non-blocking so that a short clone is
/// preferred over sleeping.
pub const MIN_BIO_PAGES: usize = 8;

/// Largest IV any supported cipher takes (AES block size).
pub const MAX_IV_SIZE: usize = 16;

#[derive(thiserror::Error, Debug)]
pub enum CryptError {
    #[error("invalid table line: {0}")]
    BadTable(String),

    #[error("cipher setup failed: {0}")]
    CipherSetup(String),

    #[error("iv generator setup failed: {0}")]
    IvSetup(String),

    #[error("out of pool reserves")]
    NoMemory,

    #[error("crypto conversion failed")]
    ConvertFailed,

    #[error("crypt key is not set")]
    KeyNotValid,

    #[error("target is not suspended")]
    NotSuspended,

    #[error("unrecognised message")]
    BadMessage,

    #[error("other failure")]
    OtherError(i32),
}

impl CryptError {
    /// Negative POSIX errno equivalent, the form in which errors travel the
    /// bio completion path.
    pub fn errno(&self) -> i32 {
        match self {
            CryptError::BadTable(_)
            | CryptError::CipherSetup(_)
            | CryptError::IvSetup(_)
            | CryptError::NotSuspended
            | CryptError::BadMessage => -libc::EINVAL,
            CryptError::NoMemory => -libc::ENOMEM,
            CryptError::ConvertFailed => -libc::EIO,
            CryptError::KeyNotValid => -libc::EAGAIN,
            CryptError::OtherError(e) => *e,
        }
    }
}

bitflags::bitflags! {
    /// Runtime state bits of a crypt target.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CryptFlags: u32 {
        /// Set between postsuspend and resume; gates key manipulation.
        const SUSPENDED = 1 << 0;
        /// A key of the configured size is installed.
        const KEY_VALID = 1 << 1;
    }
}

pub use bio::{Bio, BioVec, Direction, Page};
pub use cipher::{CryptBackend, OffloadEngine};
pub use ctrl::{CryptTarget, CryptTargetBuilder, StatusType};
