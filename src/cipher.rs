//! Cipher backends behind the single sector-conversion primitive.
//!
//! Two interchangeable backends exist: a synchronous in-process one built
//! on block-cipher primitives, and a session-based offload engine whose
//! completions arrive via callback on the engine's worker threads. The
//! conversion context never sees which one is in use; the difference is
//! confined to whether the pending count of the owning lifecycle object is
//! dropped inline or from a completion callback.

use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use aes::cipher::block_padding::NoPadding;
use aes::cipher::{
    Block, BlockCipher, BlockDecrypt, BlockDecryptMut, BlockEncrypt, BlockEncryptMut,
    BlockSizeUser, KeyInit, KeyIvInit,
};
use slab::Slab;
use zeroize::Zeroizing;

use crate::bio::{BioVec, Direction};
use crate::ctrl::CryptConfig;
use crate::io::{self, CryptIo};
use crate::{CryptError, MAX_IV_SIZE, SECTOR_SIZE};

/// Bound on the offload write barrier.
pub(crate) const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherFamily {
    Aes,
    Des,
    Des3Ede,
}

impl CipherFamily {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "aes" => Some(CipherFamily::Aes),
            "des" => Some(CipherFamily::Des),
            "des3_ede" => Some(CipherFamily::Des3Ede),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CipherFamily::Aes => "aes",
            CipherFamily::Des => "des",
            CipherFamily::Des3Ede => "des3_ede",
        }
    }

    pub fn block_size(&self) -> usize {
        match self {
            CipherFamily::Aes => 16,
            CipherFamily::Des | CipherFamily::Des3Ede => 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainMode {
    Cbc,
    Ecb,
}

impl ChainMode {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "cbc" => Some(ChainMode::Cbc),
            "ecb" => Some(ChainMode::Ecb),
            _ => None,
        }
    }
}

/// Single-block transform, used to encrypt sector numbers for IV
/// generation.
#[derive(Debug)]
pub(crate) enum BlockTfm {
    Aes128(aes::Aes128),
    Aes192(aes::Aes192),
    Aes256(aes::Aes256),
    Des(des::Des),
    Des3(des::TdesEde3),
}

impl BlockTfm {
    pub(crate) fn new(family: CipherFamily, key: &[u8]) -> Result<Self, ()> {
        match family {
            CipherFamily::Aes => match key.len() {
                16 => Ok(BlockTfm::Aes128(
                    aes::Aes128::new_from_slice(key).map_err(drop)?,
                )),
                24 => Ok(BlockTfm::Aes192(
                    aes::Aes192::new_from_slice(key).map_err(drop)?,
                )),
                32 => Ok(BlockTfm::Aes256(
                    aes::Aes256::new_from_slice(key).map_err(drop)?,
                )),
                _ => Err(()),
            },
            CipherFamily::Des => Ok(BlockTfm::Des(des::Des::new_from_slice(key).map_err(drop)?)),
            CipherFamily::Des3Ede => Ok(BlockTfm::Des3(
                des::TdesEde3::new_from_slice(key).map_err(drop)?,
            )),
        }
    }

    pub(crate) fn block_size(&self) -> usize {
        match self {
            BlockTfm::Aes128(_) | BlockTfm::Aes192(_) | BlockTfm::Aes256(_) => 16,
            BlockTfm::Des(_) | BlockTfm::Des3(_) => 8,
        }
    }

    /// Encrypt exactly one cipher block in place; `buf` must be
    /// [`BlockTfm::block_size`] bytes.
    pub(crate) fn encrypt_block_in_place(&self, buf: &mut [u8]) {
        match self {
            BlockTfm::Aes128(t) => t.encrypt_block(Block::<aes::Aes128>::from_mut_slice(buf)),
            BlockTfm::Aes192(t) => t.encrypt_block(Block::<aes::Aes192>::from_mut_slice(buf)),
            BlockTfm::Aes256(t) => t.encrypt_block(Block::<aes::Aes256>::from_mut_slice(buf)),
            BlockTfm::Des(t) => t.encrypt_block(Block::<des::Des>::from_mut_slice(buf)),
            BlockTfm::Des3(t) => t.encrypt_block(Block::<des::TdesEde3>::from_mut_slice(buf)),
        }
    }
}

/// Run one sector through the keyed cipher in place.
pub(crate) fn sector_crypt(
    family: CipherFamily,
    mode: ChainMode,
    dir: Direction,
    key: &[u8],
    iv: &[u8],
    buf: &mut [u8],
) -> Result<(), i32> {
    match family {
        CipherFamily::Aes => match key.len() {
            16 => crypt_one::<aes::Aes128>(mode, dir, key, iv, buf),
            24 => crypt_one::<aes::Aes192>(mode, dir, key, iv, buf),
            32 => crypt_one::<aes::Aes256>(mode, dir, key, iv, buf),
            _ => Err(-libc::EINVAL),
        },
        CipherFamily::Des => crypt_one::<des::Des>(mode, dir, key, iv, buf),
        CipherFamily::Des3Ede => crypt_one::<des::TdesEde3>(mode, dir, key, iv, buf),
    }
}

fn crypt_one<C>(
    mode: ChainMode,
    dir: Direction,
    key: &[u8],
    iv: &[u8],
    buf: &mut [u8],
) -> Result<(), i32>
where
    C: BlockCipher + BlockEncrypt + BlockDecrypt + KeyInit,
{
    match (mode, dir) {
        (ChainMode::Cbc, Direction::Write) => {
            let enc = cbc::Encryptor::<C>::new_from_slices(key, iv).map_err(|_| -libc::EINVAL)?;
            let len = buf.len();
            enc.encrypt_padded_mut::<NoPadding>(buf, len)
                .map_err(|_| -libc::EIO)?;
        }
        (ChainMode::Cbc, Direction::Read) => {
            let dec = cbc::Decryptor::<C>::new_from_slices(key, iv).map_err(|_| -libc::EINVAL)?;
            dec.decrypt_padded_mut::<NoPadding>(buf)
                .map_err(|_| -libc::EIO)?;
        }
        (ChainMode::Ecb, _) => {
            let tfm = C::new_from_slice(key).map_err(|_| -libc::EINVAL)?;
            for block in buf.chunks_exact_mut(C::block_size()) {
                let block = Block::<C>::from_mut_slice(block);
                match dir {
                    Direction::Write => tfm.encrypt_block(block),
                    Direction::Read => tfm.decrypt_block(block),
                }
            }
        }
    }

    Ok(())
}

/// Offload algorithms; the session engine only speaks chained CBC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffloadAlg {
    AesCbc,
    DesCbc,
    Des3EdeCbc,
}

impl OffloadAlg {
    pub(crate) fn from_spec(cipher: &str, chainmode: &str) -> Option<Self> {
        if chainmode != "cbc" {
            return None;
        }
        match cipher {
            "aes" => Some(OffloadAlg::AesCbc),
            "des" => Some(OffloadAlg::DesCbc),
            "des3_ede" => Some(OffloadAlg::Des3EdeCbc),
            _ => None,
        }
    }

    pub fn iv_size(&self) -> usize {
        match self {
            OffloadAlg::AesCbc => 16,
            _ => 8,
        }
    }

    pub(crate) fn family(&self) -> CipherFamily {
        match self {
            OffloadAlg::AesCbc => CipherFamily::Aes,
            OffloadAlg::DesCbc => CipherFamily::Des,
            OffloadAlg::Des3EdeCbc => CipherFamily::Des3Ede,
        }
    }
}

/// Backend selection for a target.
#[derive(Clone, Default)]
pub enum CryptBackend {
    #[default]
    Sync,
    Offload(Arc<OffloadEngine>),
}

/// Resolved backend state carried by the target configuration.
pub(crate) enum Backend {
    Sync {
        family: CipherFamily,
        mode: ChainMode,
    },
    Offload {
        engine: Arc<OffloadEngine>,
        alg: OffloadAlg,
        sid: Mutex<Option<usize>>,
    },
}

impl Backend {
    pub(crate) fn is_offload(&self) -> bool {
        matches!(self, Backend::Offload { .. })
    }

    /// Whether the backend can address pages the submitter marked as high;
    /// when it cannot, the mapper installs a bounce view.
    pub(crate) fn dma_highmem(&self) -> bool {
        match self {
            Backend::Sync { .. } => true,
            Backend::Offload { engine, .. } => engine.dma_highmem(),
        }
    }
}

/// Completion token carried by an offload request. Reads route through the
/// lifecycle object so every sector completion is accounted; writes route
/// through the per-conversion barrier.
pub(crate) enum CipherToken {
    None,
    Read(Arc<CryptIo>),
    Write(Arc<WriteBarrier>),
}

impl CipherToken {
    pub(crate) fn complete(self, status: i32) {
        match self {
            CipherToken::None => {}
            CipherToken::Read(rlo) => io::dec_pending(&rlo, status),
            CipherToken::Write(barrier) => barrier.complete(status),
        }
    }
}

/// Rendezvous between a writing conversion and its offload completions.
pub(crate) struct WriteBarrier {
    state: Mutex<BarrierState>,
    cv: Condvar,
}

struct BarrierState {
    completed: u32,
    error: i32,
}

impl WriteBarrier {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(WriteBarrier {
            state: Mutex::new(BarrierState {
                completed: 0,
                error: 0,
            }),
            cv: Condvar::new(),
        })
    }

    pub(crate) fn complete(&self, status: i32) {
        let mut state = self.state.lock().unwrap();
        state.completed += 1;
        if status < 0 && state.error == 0 {
            state.error = status;
        }
        drop(state);
        self.cv.notify_all();
    }

    /// Wait until `pending` completions arrived, returning the first error
    /// seen. A timeout is fatal: late completions are dropped on the floor
    /// and the caller must fail the request.
    pub(crate) fn wait(&self, pending: u32, timeout: Duration) -> i32 {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        while state.completed < pending {
            let now = Instant::now();
            if now >= deadline {
                log::error!(
                    "write conversion stalled for {}s, {} pending {} completed",
                    timeout.as_secs(),
                    pending,
                    state.completed
                );
                return -libc::EIO;
            }
            let (s, _) = self.cv.wait_timeout(state, deadline - now).unwrap();
            state = s;
        }

        state.error
    }
}

/// The conversion primitive: derive the IV for `sector` and run one
/// sector from `inp` to `out` (the same region for in-place decryption).
///
/// On the synchronous backend the result is final when this returns; on
/// the offload backend a successful return only means the request was
/// dispatched and the token will be completed from the engine.
pub(crate) fn convert_sector(
    cc: &CryptConfig,
    out: BioVec,
    inp: BioVec,
    dir: Direction,
    sector: u64,
    token: CipherToken,
) -> Result<(), i32> {
    debug_assert_eq!(out.len, SECTOR_SIZE);
    debug_assert_eq!(inp.len, SECTOR_SIZE);

    let mut ivbuf = [0u8; MAX_IV_SIZE];
    let iv_len = cc.iv_size;
    if let Some(gen) = cc.iv_gen.as_ref() {
        gen.generate(&mut ivbuf[..iv_len], sector);
    }

    match &cc.backend {
        Backend::Sync { family, mode } => {
            debug_assert!(matches!(token, CipherToken::None));
            let key = cc.key.read().unwrap();
            // The primitive operates in place on the destination; distinct
            // source data is staged there first.
            unsafe {
                if !out.same_region(&inp) {
                    out.page
                        .bytes_mut(out.offset, out.len)
                        .copy_from_slice(inp.page.bytes(inp.offset, inp.len));
                }
                let dst = out.page.bytes_mut(out.offset, out.len);
                sector_crypt(*family, *mode, dir, key.as_slice(), &ivbuf[..iv_len], dst)
            }
        }
        Backend::Offload { engine, sid, .. } => {
            if cc.iv_gen.is_none() || iv_len == 0 {
                log::error!("offload backend only supports chained modes with an IV");
                token.complete(-libc::EPERM);
                return Err(-libc::EPERM);
            }
            let sid = match *sid.lock().unwrap() {
                Some(sid) => sid,
                None => {
                    token.complete(-libc::EINVAL);
                    return Err(-libc::EINVAL);
                }
            };
            engine.dispatch(OffloadRequest {
                sid,
                dir,
                iv: ivbuf,
                iv_len,
                out,
                inp,
                sector,
                token,
            })
        }
    }
}

struct OffloadSession {
    alg: OffloadAlg,
    key: Zeroizing<Vec<u8>>,
}

pub(crate) struct OffloadRequest {
    sid: usize,
    dir: Direction,
    iv: [u8; MAX_IV_SIZE],
    iv_len: usize,
    out: BioVec,
    inp: BioVec,
    sector: u64,
    token: CipherToken,
}

enum EngineMsg {
    Request(OffloadRequest),
    Shutdown,
}

#[cfg(test)]
type FaultHook = Box<dyn Fn(u64) -> bool + Send>;

struct EngineShared {
    sessions: RwLock<Slab<OffloadSession>>,
    inflight: Mutex<u32>,
    inflight_cv: Condvar,
    #[cfg(test)]
    fault: Mutex<Option<FaultHook>>,
}

/// Software model of a session-oriented crypto offload device: a bounded
/// submission queue in front of worker threads, completion via callback,
/// and a global in-flight counter that throttles submitters when the queue
/// reports busy. The device cannot address pages marked high, which is
/// what the bounce shim exists for.
pub struct OffloadEngine {
    shared: Arc<EngineShared>,
    tx: SyncSender<EngineMsg>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl OffloadEngine {
    /// # Arguments:
    ///
    /// * `nr_workers`: completion threads executing requests
    /// * `depth`: submission queue depth; submitters back off beyond it
    pub fn new(nr_workers: usize, depth: usize) -> OffloadEngine {
        let nr_workers = nr_workers.max(1);
        let (tx, rx) = mpsc::sync_channel(depth.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let shared = Arc::new(EngineShared {
            sessions: RwLock::new(Slab::new()),
            inflight: Mutex::new(0),
            inflight_cv: Condvar::new(),
            #[cfg(test)]
            fault: Mutex::new(None),
        });

        let workers = (0..nr_workers)
            .map(|i| {
                let shared = shared.clone();
                let rx = rx.clone();
                thread::Builder::new()
                    .name(format!("offload/{}", i))
                    .spawn(move || worker_main(shared, rx))
                    .unwrap()
            })
            .collect();

        OffloadEngine {
            shared,
            tx,
            workers: Mutex::new(workers),
        }
    }

    /// Open a keyed session; the returned id is carried by every request.
    pub fn new_session(&self, alg: OffloadAlg, key: &[u8]) -> Result<usize, CryptError> {
        let valid = match alg {
            OffloadAlg::AesCbc => matches!(key.len(), 16 | 24 | 32),
            OffloadAlg::DesCbc => key.len() == 8,
            OffloadAlg::Des3EdeCbc => key.len() == 24,
        };
        if !valid {
            return Err(CryptError::CipherSetup(format!(
                "invalid key size {} for offload session",
                key.len()
            )));
        }

        let mut sessions = self.shared.sessions.write().unwrap();
        let sid = sessions.insert(OffloadSession {
            alg,
            key: Zeroizing::new(key.to_vec()),
        });
        log::trace!("offload session {} opened", sid);
        Ok(sid)
    }

    pub fn free_session(&self, sid: usize) {
        let mut sessions = self.shared.sessions.write().unwrap();
        if sessions.contains(sid) {
            sessions.remove(sid);
            log::trace!("offload session {} closed", sid);
        }
    }

    pub fn dma_highmem(&self) -> bool {
        false
    }

    pub fn in_flight(&self) -> u32 {
        *self.shared.inflight.lock().unwrap()
    }

    #[cfg(test)]
    pub(crate) fn set_fault_hook(&self, hook: impl Fn(u64) -> bool + Send + 'static) {
        *self.shared.fault.lock().unwrap() = Some(Box::new(hook));
    }

    /// Submit a request, backing off while the queue is busy: wait until
    /// the global in-flight count has dropped below what we last observed,
    /// then retry.
    pub(crate) fn dispatch(&self, req: OffloadRequest) -> Result<(), i32> {
        let mut msg = EngineMsg::Request(req);
        loop {
            msg = match self.tx.try_send(msg) {
                Ok(()) => {
                    *self.shared.inflight.lock().unwrap() += 1;
                    return Ok(());
                }
                Err(TrySendError::Full(m)) => m,
                Err(TrySendError::Disconnected(m)) => {
                    if let EngineMsg::Request(req) = m {
                        req.token.complete(-libc::EIO);
                    }
                    return Err(-libc::EIO);
                }
            };

            let observed = *self.shared.inflight.lock().unwrap();
            if observed == 0 {
                thread::yield_now();
            } else {
                let mut inflight = self.shared.inflight.lock().unwrap();
                while *inflight >= observed {
                    inflight = self.shared.inflight_cv.wait(inflight).unwrap();
                }
            }
        }
    }
}

impl std::fmt::Debug for OffloadEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OffloadEngine")
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

impl Drop for OffloadEngine {
    fn drop(&mut self) {
        let workers = std::mem::take(&mut *self.workers.lock().unwrap());
        for _ in &workers {
            let _ = self.tx.send(EngineMsg::Shutdown);
        }
        for worker in workers {
            // The engine can be dropped from one of its own completion
            // threads; that thread drains its shutdown on its own.
            if worker.thread().id() == thread::current().id() {
                continue;
            }
            let _ = worker.join();
        }
    }
}

fn worker_main(shared: Arc<EngineShared>, rx: Arc<Mutex<Receiver<EngineMsg>>>) {
    loop {
        let msg = {
            let rx = rx.lock().unwrap();
            rx.recv()
        };
        let req = match msg {
            Ok(EngineMsg::Request(req)) => req,
            Ok(EngineMsg::Shutdown) | Err(_) => break,
        };

        let status = execute(&shared, &req);
        req.token.complete(status);

        {
            let mut inflight = shared.inflight.lock().unwrap();
            *inflight = inflight.saturating_sub(1);
        }
        shared.inflight_cv.notify_all();
    }
}

fn execute(shared: &EngineShared, req: &OffloadRequest) -> i32 {
    log::trace!("offload request: {:?} sector {}", req.dir, req.sector);

    #[cfg(test)]
    if let Some(hook) = shared.fault.lock().unwrap().as_ref() {
        if hook(req.sector) {
            return -libc::EIO;
        }
    }

    let sessions = shared.sessions.read().unwrap();
    let Some(session) = sessions.get(req.sid) else {
        return -libc::EINVAL;
    };

    // In place on the destination; distinct source data is staged first.
    unsafe {
        if !req.out.same_region(&req.inp) {
            req.out
                .page
                .bytes_mut(req.out.offset, req.out.len)
                .copy_from_slice(req.inp.page.bytes(req.inp.offset, req.inp.len));
        }
        let dst = req.out.page.bytes_mut(req.out.offset, req.out.len);
        match sector_crypt(
            session.alg.family(),
            ChainMode::Cbc,
            req.dir,
            &session.key,
            &req.iv[..req.iv_len],
            dst,
        ) {
            Ok(()) => 0,
            Err(e) => e,
        }
    }
}
