//! Target construction and the control-plane surface.
//!
//! A target maps a linear range of a backing device and encrypts or
//! decrypts at the same time. It is described by the classic five-field
//! table line:
//!
//! ```text
//! <cipher-spec> <key-hex> <iv-offset> <device> <start-sector>
//! ```
//!
//! where the cipher spec is `cipher[-chainmode[-ivmode[:ivopts]]]`, e.g.
//! `aes-cbc-essiv:sha256`. Construction is also available programmatically
//! through [`CryptTargetBuilder`].

use std::fmt::Write as _;
use std::sync::{Arc, Mutex, RwLock};

use derive_setters::*;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::bio::Bio;
use crate::blkdev::BlockDevice;
use crate::cipher::{Backend, ChainMode, CipherFamily, CryptBackend, OffloadAlg};
use crate::helpers::{decode_hex, hex_string, IoBuf};
use crate::io;
use crate::iv::IvGen;
use crate::pool::{IoPool, PagePool};
use crate::queue::CryptQueue;
use crate::{CryptError, CryptFlags, MIN_POOL_PAGES};

/// Key storage. Locked into RAM when the platform allows it and zeroed on
/// every destruction path; the bytes never leave the configuration.
pub(crate) struct KeyBuf {
    buf: IoBuf,
    len: usize,
}

impl KeyBuf {
    fn new(len: usize) -> Self {
        KeyBuf {
            buf: IoBuf::new_with_mlock(len.max(1)),
            len,
        }
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    fn set(&mut self, bytes: &[u8]) {
        debug_assert_eq!(bytes.len(), self.len);
        self.buf[..self.len].copy_from_slice(bytes);
    }

    pub(crate) fn wipe(&mut self) {
        self.buf[..self.len].zeroize();
    }
}

/// Immutable-during-I/O state of one target; only the key slot may change,
/// and only while suspended.
pub(crate) struct CryptConfig {
    pub(crate) dev: Arc<dyn BlockDevice>,
    pub(crate) dev_name: String,
    /// First sector used on the backing device.
    pub(crate) start: u64,
    /// First logical sector of the mapped range.
    pub(crate) begin: u64,
    /// Added to the logical sector before IV derivation.
    pub(crate) iv_offset: u64,
    pub(crate) iv_size: usize,
    pub(crate) cipher: String,
    pub(crate) chainmode: String,
    /// IV mode with its options restored (`essiv:sha256`), for status.
    pub(crate) iv_mode: Option<String>,
    pub(crate) iv_gen: Option<IvGen>,
    pub(crate) backend: Backend,
    pub(crate) key: RwLock<KeyBuf>,
    pub(crate) flags: Mutex<CryptFlags>,
    pub(crate) page_pool: PagePool,
    pub(crate) io_pool: IoPool,
    pub(crate) queue: Arc<CryptQueue>,
}

impl Drop for CryptConfig {
    fn drop(&mut self) {
        if let Backend::Offload { engine, sid, .. } = &self.backend {
            if let Some(sid) = sid.lock().unwrap().take() {
                engine.free_session(sid);
            }
        }
        // Key material must not outlive the configuration.
        self.key.write().unwrap().wipe();
        log::info!("crypt target on {} destroyed", self.dev_name);
    }
}

#[derive(Debug)]
pub(crate) struct CipherSpec {
    pub cipher: String,
    pub chainmode: String,
    pub ivmode: Option<String>,
    pub ivopts: Option<String>,
}

/// Split `cipher[-chainmode[-ivmode[:ivopts]]]`, applying the
/// compatibility defaults for old-style specs: a bare cipher, or
/// `cipher-plain` without an ivmode, means cbc with plain IVs.
pub(crate) fn parse_cipher_spec(spec: &str) -> Result<CipherSpec, CryptError> {
    let mut parts = spec.split('-');
    let cipher = match parts.next() {
        Some(c) if !c.is_empty() => c.to_string(),
        _ => return Err(CryptError::BadTable("missing cipher name".to_string())),
    };
    let chainmode = parts.next();
    let ivpart = parts.next();
    if parts.next().is_some() {
        log::warn!("unexpected additional cipher options in '{}'", spec);
    }

    let (ivmode, ivopts) = match ivpart {
        Some(p) => {
            let mut it = p.splitn(2, ':');
            (
                it.next().map(str::to_string),
                it.next().map(str::to_string),
            )
        }
        None => (None, None),
    };

    let (chainmode, ivmode) = match chainmode {
        None => ("cbc".to_string(), Some("plain".to_string())),
        Some("plain") if ivmode.is_none() => ("cbc".to_string(), Some("plain".to_string())),
        Some(c) => (c.to_string(), ivmode),
    };

    if chainmode != "ecb" && ivmode.is_none() {
        return Err(CryptError::BadTable(
            "this chaining mode requires an IV mechanism".to_string(),
        ));
    }

    Ok(CipherSpec {
        cipher,
        chainmode,
        ivmode,
        ivopts,
    })
}

fn decode_key(keybuf: &mut KeyBuf, hex: &str) -> Result<(), CryptError> {
    let bad = || CryptError::BadTable("error decoding key".to_string());

    if keybuf.len() == 0 {
        if hex != "-" {
            return Err(bad());
        }
        return Ok(());
    }

    let mut bytes = vec![0u8; keybuf.len()];
    decode_hex(hex, &mut bytes).map_err(|_| bad())?;
    keybuf.set(&bytes);
    bytes.zeroize();
    Ok(())
}

/// Construction parameters for a crypt target.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use cryptblk::blkdev::RamDisk;
/// use cryptblk::CryptTargetBuilder;
///
/// # fn example() -> Result<(), cryptblk::CryptError> {
/// let disk = Arc::new(RamDisk::new("ram0", 1 << 16));
/// let tgt = CryptTargetBuilder::default()
///     .cipher("aes-cbc-essiv:sha256")
///     .key("000102030405060708090a0b0c0d0e0f")
///     .build(disk)?;
/// # Ok(())
/// # }
/// ```
#[derive(Setters)]
pub struct CryptTargetBuilder<'a> {
    /// full cipher spec `cipher[-chainmode[-ivmode[:ivopts]]]`
    cipher: &'a str,

    /// hex key, or "-" for a zero-length key slot
    key: &'a str,

    /// sector count added to the logical sector before IV derivation
    iv_offset: u64,

    /// first sector used on the backing device
    start: u64,

    /// first logical sector of the mapped range
    begin: u64,

    /// cipher backend; defaults to the synchronous in-process one
    backend: CryptBackend,

    /// worker threads on a freshly created queue
    nr_workers: usize,

    /// page pool reserve for write cloning and bouncing
    pool_pages: usize,

    /// post work to an existing queue instead of creating one
    queue: Option<Arc<CryptQueue>>,
}

impl Default for CryptTargetBuilder<'_> {
    fn default() -> Self {
        CryptTargetBuilder {
            cipher: "aes",
            key: "-",
            iv_offset: 0,
            start: 0,
            begin: 0,
            backend: CryptBackend::Sync,
            nr_workers: 1,
            pool_pages: MIN_POOL_PAGES,
            queue: None,
        }
    }
}

impl CryptTargetBuilder<'_> {
    pub fn build(self, dev: Arc<dyn BlockDevice>) -> Result<CryptTarget, CryptError> {
        let spec = parse_cipher_spec(self.cipher)?;

        // A dash reserves a zero-length key slot without installing
        // key material.
        let key_size = if self.key == "-" { 0 } else { self.key.len() / 2 };
        let mut keybuf = KeyBuf::new(key_size);
        decode_key(&mut keybuf, self.key)?;
        let flags = CryptFlags::KEY_VALID;

        let family = CipherFamily::from_name(&spec.cipher).ok_or_else(|| {
            CryptError::CipherSetup(format!("unknown cipher '{}'", spec.cipher))
        })?;

        let (backend, mut iv_size) = match self.backend {
            CryptBackend::Sync => {
                let mode = ChainMode::from_name(&spec.chainmode).ok_or_else(|| {
                    CryptError::CipherSetup(format!("unknown chain mode '{}'", spec.chainmode))
                })?;
                crate::cipher::BlockTfm::new(family, keybuf.as_slice())
                    .map_err(|_| CryptError::CipherSetup("error setting key".to_string()))?;
                let iv_size = match mode {
                    ChainMode::Cbc => family.block_size(),
                    ChainMode::Ecb => 0,
                };
                (Backend::Sync { family, mode }, iv_size)
            }
            CryptBackend::Offload(engine) => {
                let alg =
                    OffloadAlg::from_spec(&spec.cipher, &spec.chainmode).ok_or_else(|| {
                        CryptError::CipherSetup(
                            "unknown cipher or bad chain mode for the offload backend".to_string(),
                        )
                    })?;
                let sid = engine.new_session(alg, keybuf.as_slice())?;
                let iv_size = alg.iv_size();
                (
                    Backend::Offload {
                        engine,
                        alg,
                        sid: Mutex::new(Some(sid)),
                    },
                    iv_size,
                )
            }
        };

        let mut iv_gen = None;
        let mut iv_mode = None;
        if let Some(mode) = spec.ivmode.as_deref() {
            if iv_size == 0 {
                log::warn!("selected cipher does not support IVs, ignoring '{}'", mode);
            } else {
                // At least a 64-bit sector number must fit in the buffer.
                iv_size = iv_size.max(8);
                iv_gen = Some(match mode {
                    "plain" => IvGen::Plain,
                    "essiv" => {
                        let digest = spec.ivopts.as_deref().ok_or_else(|| {
                            CryptError::IvSetup(
                                "digest algorithm missing for essiv mode".to_string(),
                            )
                        })?;
                        IvGen::essiv(family, keybuf.as_slice(), digest, iv_size)?
                    }
                    "benbi" => IvGen::benbi(family.block_size())?,
                    "null" => IvGen::Null,
                    other => {
                        return Err(CryptError::BadTable(format!("invalid IV mode '{}'", other)))
                    }
                });
                iv_mode = Some(match &spec.ivopts {
                    Some(opts) => format!("{}:{}", mode, opts),
                    None => mode.to_string(),
                });
            }
        }
        if iv_gen.is_none() {
            iv_size = 0;
        }

        let queue = self
            .queue
            .unwrap_or_else(|| CryptQueue::new("cryptd", self.nr_workers));
        let dev_name = dev.name().to_string();

        let cc = Arc::new(CryptConfig {
            dev,
            dev_name,
            start: self.start,
            begin: self.begin,
            iv_offset: self.iv_offset,
            iv_size,
            cipher: spec.cipher,
            chainmode: spec.chainmode,
            iv_mode,
            iv_gen,
            backend,
            key: RwLock::new(keybuf),
            flags: Mutex::new(flags),
            page_pool: PagePool::with_capacity(self.pool_pages),
            io_pool: IoPool::new(),
            queue,
        });

        log::info!(
            "crypt target on {} created ({}-{}{})",
            cc.dev_name,
            cc.cipher,
            cc.chainmode,
            cc.iv_mode
                .as_deref()
                .map(|m| format!("-{}", m))
                .unwrap_or_default()
        );

        Ok(CryptTarget { cc })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusType {
    Info,
    Table,
}

/// Serialized view of a target's parameters.
#[derive(Debug, Serialize, Deserialize)]
struct TargetParams {
    cipher: String,
    chainmode: String,
    iv_mode: Option<String>,
    key_size: usize,
    iv_offset: u64,
    start: u64,
    device: String,
    device_sectors: u64,
    backend: String,
    suspended: bool,
}

/// A transparent encryption target over a backing device.
pub struct CryptTarget {
    cc: Arc<CryptConfig>,
}

impl CryptTarget {
    /// Construct from the five-field table line. `resolve` maps the device
    /// field to a backing device, taking the role of the surrounding
    /// framework's device lookup.
    pub fn from_table(
        line: &str,
        resolve: impl FnOnce(&str) -> Option<Arc<dyn BlockDevice>>,
    ) -> Result<Self, CryptError> {
        Self::from_table_with_backend(line, resolve, CryptBackend::Sync)
    }

    pub fn from_table_with_backend(
        line: &str,
        resolve: impl FnOnce(&str) -> Option<Arc<dyn BlockDevice>>,
        backend: CryptBackend,
    ) -> Result<Self, CryptError> {
        let argv: Vec<&str> = line.split_whitespace().collect();
        if argv.len() != 5 {
            return Err(CryptError::BadTable("not enough arguments".to_string()));
        }

        let iv_offset: u64 = argv[2]
            .parse()
            .map_err(|_| CryptError::BadTable("invalid iv_offset sector".to_string()))?;
        let start: u64 = argv[4]
            .parse()
            .map_err(|_| CryptError::BadTable("invalid device sector".to_string()))?;
        let dev = resolve(argv[3])
            .ok_or_else(|| CryptError::BadTable("device lookup failed".to_string()))?;

        CryptTargetBuilder::default()
            .cipher(argv[0])
            .key(argv[1])
            .iv_offset(iv_offset)
            .start(start)
            .backend(backend)
            .build(dev)
    }

    /// Map one incoming bio. Never performs sleeping cryptography in the
    /// caller's context; the request is posted to the worker queue.
    pub fn map(&self, bio: Bio) {
        io::map_io(&self.cc, bio);
    }

    pub fn flags(&self) -> CryptFlags {
        *self.cc.flags.lock().unwrap()
    }

    pub fn status(&self, kind: StatusType) -> String {
        match kind {
            StatusType::Info => String::new(),
            StatusType::Table => {
                let cc = &self.cc;
                let mut out = String::new();
                match &cc.iv_mode {
                    Some(iv_mode) => {
                        write!(out, "{}-{}-{} ", cc.cipher, cc.chainmode, iv_mode).unwrap()
                    }
                    None => write!(out, "{}-{} ", cc.cipher, cc.chainmode).unwrap(),
                }

                let key = cc.key.read().unwrap();
                if key.len() > 0 {
                    out.push_str(&hex_string(key.as_slice()));
                } else {
                    out.push('-');
                }
                drop(key);

                write!(out, " {} {} {}", cc.iv_offset, cc.dev_name, cc.start).unwrap();
                out
            }
        }
    }

    pub fn dump_json(&self) -> serde_json::Value {
        let cc = &self.cc;
        serde_json::to_value(TargetParams {
            cipher: cc.cipher.clone(),
            chainmode: cc.chainmode.clone(),
            iv_mode: cc.iv_mode.clone(),
            key_size: cc.key.read().unwrap().len(),
            iv_offset: cc.iv_offset,
            start: cc.start,
            device: cc.dev_name.clone(),
            device_sectors: cc.dev.sectors(),
            backend: if cc.backend.is_offload() {
                "offload".to_string()
            } else {
                "sync".to_string()
            },
            suspended: self.flags().contains(CryptFlags::SUSPENDED),
        })
        .unwrap()
    }

    /// Message interface, valid only while suspended:
    ///
    /// ```text
    /// key set <keyhex>
    /// key wipe
    /// ```
    pub fn message(&self, argv: &[&str]) -> Result<(), CryptError> {
        if argv.len() >= 2 && argv[0].eq_ignore_ascii_case("key") {
            if !self.flags().contains(CryptFlags::SUSPENDED) {
                log::warn!("not suspended during key manipulation");
                return Err(CryptError::NotSuspended);
            }
            if argv.len() == 3 && argv[1].eq_ignore_ascii_case("set") {
                return self.set_key(argv[2]);
            }
            if argv.len() == 2 && argv[1].eq_ignore_ascii_case("wipe") {
                return self.wipe_key();
            }
        }

        log::warn!("unrecognised message received");
        Err(CryptError::BadMessage)
    }

    fn set_key(&self, hex: &str) -> Result<(), CryptError> {
        let mut key = self.cc.key.write().unwrap();
        if hex.len() != key.len() * 2 && !(key.len() == 0 && hex == "-") {
            return Err(CryptError::BadTable("error decoding key".to_string()));
        }
        decode_key(&mut key, hex)?;

        // The offload session holds its own key copy and must be re-keyed.
        if let Backend::Offload { engine, alg, sid } = &self.cc.backend {
            let mut sid = sid.lock().unwrap();
            if let Some(old) = sid.take() {
                engine.free_session(old);
            }
            *sid = Some(engine.new_session(*alg, key.as_slice())?);
        }

        self.cc.flags.lock().unwrap().insert(CryptFlags::KEY_VALID);
        Ok(())
    }

    fn wipe_key(&self) -> Result<(), CryptError> {
        self.cc.flags.lock().unwrap().remove(CryptFlags::KEY_VALID);
        self.cc.key.write().unwrap().wipe();

        if let Backend::Offload { engine, sid, .. } = &self.cc.backend {
            if let Some(old) = sid.lock().unwrap().take() {
                engine.free_session(old);
            }
        }
        Ok(())
    }

    /// Quiesce the worker queue and enter the suspended state, in which
    /// the key slot may be manipulated.
    pub fn postsuspend(&self) {
        self.cc.queue.flush();
        self.cc.flags.lock().unwrap().insert(CryptFlags::SUSPENDED);
    }

    /// Refuse to resume while no valid key is installed; the caller is
    /// expected to retry after a `key set`.
    pub fn preresume(&self) -> Result<(), CryptError> {
        if !self.flags().contains(CryptFlags::KEY_VALID) {
            log::error!("aborting resume - crypt key is not set");
            return Err(CryptError::KeyNotValid);
        }
        Ok(())
    }

    pub fn resume(&self) {
        self.cc.flags.lock().unwrap().remove(CryptFlags::SUSPENDED);
    }

    #[cfg(test)]
    pub(crate) fn key_snapshot(&self) -> Vec<u8> {
        self.cc.key.read().unwrap().as_slice().to_vec()
    }
}

impl Drop for CryptTarget {
    fn drop(&mut self) {
        // Outstanding work still references the configuration; drain it
        // before the target goes away.
        self.cc.queue.flush();
    }
}

impl std::fmt::Debug for CryptTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptTarget")
            .field("device", &self.cc.dev_name)
            .field("cipher", &self.cc.cipher)
            .field("chainmode", &self.cc.chainmode)
            .field("iv_mode", &self.cc.iv_mode)
            .finish_non_exhaustive()
    }
}
