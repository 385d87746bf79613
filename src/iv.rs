//! Per-sector IV generation.
//!
//! Four strategies, selected by the ivmode field of the cipher spec:
//!
//! - `plain`: the 32-bit little-endian sector number, zero padded. The
//!   default.
//! - `essiv`: the 64-bit sector number encrypted with a single-block
//!   cipher keyed by a digest of the data key, so the IV itself is a keyed
//!   function of the sector (defeats watermarking).
//! - `benbi`: big-endian narrow-block counter starting at 1, for chaining
//!   modes that treat sub-sector blocks as units.
//! - `null`: all zeroes, only for compatibility with legacy on-disk
//!   formats. Do not use for new devices.

use zeroize::Zeroize;

use crate::cipher::{BlockTfm, CipherFamily};
use crate::CryptError;

#[derive(Debug)]
pub(crate) enum IvGen {
    Plain,
    Essiv { tfm: BlockTfm },
    Benbi { shift: u32 },
    Null,
}

impl IvGen {
    /// Build the essiv state: digest the data key into a salt and key a
    /// single-block cipher of the same family with it.
    pub(crate) fn essiv(
        family: CipherFamily,
        key: &[u8],
        digest: &str,
        iv_size: usize,
    ) -> Result<Self, CryptError> {
        use sha2::Digest;

        let mut salt = match digest {
            "sha224" => sha2::Sha224::digest(key).to_vec(),
            "sha256" => sha2::Sha256::digest(key).to_vec(),
            "sha384" => sha2::Sha384::digest(key).to_vec(),
            "sha512" => sha2::Sha512::digest(key).to_vec(),
            _ => {
                return Err(CryptError::IvSetup(format!(
                    "unknown digest algorithm '{}'",
                    digest
                )))
            }
        };

        let tfm = BlockTfm::new(family, &salt).map_err(|_| {
            CryptError::IvSetup("failed to key the sector-number cipher".to_string())
        });
        salt.zeroize();
        let tfm = tfm?;

        if tfm.block_size() != iv_size {
            return Err(CryptError::IvSetup(
                "sector-number cipher block size does not match the IV size".to_string(),
            ));
        }

        Ok(IvGen::Essiv { tfm })
    }

    /// Compute how far the sector count must be shifted to become the
    /// narrow-block count.
    pub(crate) fn benbi(block_size: usize) -> Result<Self, CryptError> {
        if !block_size.is_power_of_two() {
            return Err(CryptError::IvSetup(
                "cipher block size is not a power of 2".to_string(),
            ));
        }
        let log = block_size.trailing_zeros();
        if log > 9 {
            return Err(CryptError::IvSetup(
                "cipher block size is larger than a sector".to_string(),
            ));
        }

        Ok(IvGen::Benbi { shift: 9 - log })
    }

    /// Write exactly `iv.len()` IV bytes for the given sector.
    pub(crate) fn generate(&self, iv: &mut [u8], sector: u64) {
        match self {
            IvGen::Plain => {
                iv.fill(0);
                iv[..4].copy_from_slice(&(sector as u32).to_le_bytes());
            }
            IvGen::Essiv { tfm } => {
                iv.fill(0);
                iv[..8].copy_from_slice(&sector.to_le_bytes());
                tfm.encrypt_block_in_place(iv);
            }
            IvGen::Benbi { shift } => {
                iv.fill(0);
                let tail = iv.len() - 8;
                let count = (sector << shift).wrapping_add(1);
                iv[tail..].copy_from_slice(&count.to_be_bytes());
            }
            IvGen::Null => iv.fill(0),
        }
    }

}
