//! Sector cipher contexts: AES wrapped in the chaining modes a LUKS1
//! header may select, with per-sector IV derivation.
//!
//! A context is immutable once built. IVs and tweaks live on the stack
//! of each call, so one context can serve any number of concurrent
//! sector operations through `&self`; nothing here needs a lock.
//!
//! IV derivation per mode:
//!   - `ecb`: none (key-material wrapping only, never bulk data)
//!   - `cbc-plain`: sector number truncated to 32 bits, little-endian
//!   - `cbc-plain64`: full 64-bit sector number, little-endian
//!   - `cbc-essiv:<hash>`: sector block encrypted under a second AES
//!     key derived by hashing the data key
//!   - `xts-plain64`: little-endian sector number as the XTS tweak,
//!     Galois-doubled per block by the xts-mode crate

use aes::{Aes128, Aes192, Aes256};
use cipher::generic_array::GenericArray;
use cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use xts_mode::{get_tweak_default, Xts128};
use zeroize::Zeroizing;

use crate::digest::HashAlg;
use crate::error::LuksError;

/// AES block length in bytes. Sector sizes and key-material regions
/// must be multiples of this.
pub const BLOCK_LEN: usize = 16;

/// Chaining mode, parsed from the header's cipher-mode string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectorMode {
    Ecb,
    CbcPlain,
    CbcPlain64,
    CbcEssiv(HashAlg),
    XtsPlain64,
}

impl SectorMode {
    pub fn from_name(name: &str) -> Result<Self, LuksError> {
        if let Some(hash) = name.strip_prefix("cbc-essiv:") {
            if hash.is_empty() {
                return Err(LuksError::UnsupportedCipherMode(name.to_string()));
            }
            return Ok(SectorMode::CbcEssiv(HashAlg::from_name(hash)?));
        }
        match name {
            "ecb" => Ok(SectorMode::Ecb),
            "cbc-plain" => Ok(SectorMode::CbcPlain),
            "cbc-plain64" => Ok(SectorMode::CbcPlain64),
            "xts-plain64" => Ok(SectorMode::XtsPlain64),
            other => Err(LuksError::UnsupportedCipherMode(other.to_string())),
        }
    }
}

/// Checks the header's cipher-name string. Only AES is wired up; the
/// name is kept as a string on disk so other ciphers can be added
/// without a format change.
pub fn check_cipher_name(name: &str) -> Result<(), LuksError> {
    match name {
        "aes" => Ok(()),
        other => Err(LuksError::UnsupportedCipher(other.to_string())),
    }
}

enum AesVariant {
    Aes128(Aes128),
    Aes192(Aes192),
    Aes256(Aes256),
}

impl AesVariant {
    fn new(key: &[u8]) -> Result<Self, LuksError> {
        match key.len() {
            16 => Ok(AesVariant::Aes128(Aes128::new(GenericArray::from_slice(key)))),
            24 => Ok(AesVariant::Aes192(Aes192::new(GenericArray::from_slice(key)))),
            32 => Ok(AesVariant::Aes256(Aes256::new(GenericArray::from_slice(key)))),
            _ => Err(LuksError::InvalidKeySize),
        }
    }

    fn encrypt_block(&self, block: &mut [u8]) {
        let block = GenericArray::from_mut_slice(block);
        match self {
            AesVariant::Aes128(c) => c.encrypt_block(block),
            AesVariant::Aes192(c) => c.encrypt_block(block),
            AesVariant::Aes256(c) => c.encrypt_block(block),
        }
    }

    fn decrypt_block(&self, block: &mut [u8]) {
        let block = GenericArray::from_mut_slice(block);
        match self {
            AesVariant::Aes128(c) => c.decrypt_block(block),
            AesVariant::Aes192(c) => c.decrypt_block(block),
            AesVariant::Aes256(c) => c.decrypt_block(block),
        }
    }
}

enum XtsVariant {
    Aes128(Xts128<Aes128>),
    Aes192(Xts128<Aes192>),
    Aes256(Xts128<Aes256>),
}

impl XtsVariant {
    /// XTS keys are two concatenated halves: data key then tweak key.
    fn new(key: &[u8]) -> Result<Self, LuksError> {
        let half = key.len() / 2;
        let (k1, k2) = key.split_at(half);
        match half {
            16 => Ok(XtsVariant::Aes128(Xts128::new(
                Aes128::new(GenericArray::from_slice(k1)),
                Aes128::new(GenericArray::from_slice(k2)),
            ))),
            24 => Ok(XtsVariant::Aes192(Xts128::new(
                Aes192::new(GenericArray::from_slice(k1)),
                Aes192::new(GenericArray::from_slice(k2)),
            ))),
            32 => Ok(XtsVariant::Aes256(Xts128::new(
                Aes256::new(GenericArray::from_slice(k1)),
                Aes256::new(GenericArray::from_slice(k2)),
            ))),
            _ => Err(LuksError::InvalidKeySize),
        }
    }

    fn encrypt_area(&self, data: &mut [u8], sector_size: usize, first_sector: u64) {
        match self {
            XtsVariant::Aes128(x) => {
                x.encrypt_area(data, sector_size, first_sector as u128, get_tweak_default)
            }
            XtsVariant::Aes192(x) => {
                x.encrypt_area(data, sector_size, first_sector as u128, get_tweak_default)
            }
            XtsVariant::Aes256(x) => {
                x.encrypt_area(data, sector_size, first_sector as u128, get_tweak_default)
            }
        }
    }

    fn decrypt_area(&self, data: &mut [u8], sector_size: usize, first_sector: u64) {
        match self {
            XtsVariant::Aes128(x) => {
                x.decrypt_area(data, sector_size, first_sector as u128, get_tweak_default)
            }
            XtsVariant::Aes192(x) => {
                x.decrypt_area(data, sector_size, first_sector as u128, get_tweak_default)
            }
            XtsVariant::Aes256(x) => {
                x.decrypt_area(data, sector_size, first_sector as u128, get_tweak_default)
            }
        }
    }
}

enum Inner {
    Ecb(AesVariant),
    Cbc { cipher: AesVariant, wide_iv: bool },
    CbcEssiv { cipher: AesVariant, essiv: AesVariant },
    Xts(XtsVariant),
}

/// A keyed sector-transform context.
///
/// Two independent instances (one per direction) are derived from the
/// master key at unlock time and shared read-only afterwards.
pub struct SectorCipher {
    inner: Inner,
}

impl SectorCipher {
    /// Builds a context from the header's cipher name, mode string and
    /// a raw key.
    pub fn new(cipher_name: &str, mode: &str, key: &[u8]) -> Result<Self, LuksError> {
        check_cipher_name(cipher_name)?;
        Self::with_mode(SectorMode::from_name(mode)?, key)
    }

    pub(crate) fn with_mode(mode: SectorMode, key: &[u8]) -> Result<Self, LuksError> {
        let inner = match mode {
            SectorMode::Ecb => Inner::Ecb(AesVariant::new(key)?),
            SectorMode::CbcPlain => Inner::Cbc {
                cipher: AesVariant::new(key)?,
                wide_iv: false,
            },
            SectorMode::CbcPlain64 => Inner::Cbc {
                cipher: AesVariant::new(key)?,
                wide_iv: true,
            },
            SectorMode::CbcEssiv(hash) => {
                let cipher = AesVariant::new(key)?;
                let essiv_key = essiv_key(hash, key);
                Inner::CbcEssiv {
                    cipher,
                    essiv: AesVariant::new(&essiv_key)?,
                }
            }
            SectorMode::XtsPlain64 => Inner::Xts(XtsVariant::new(key)?),
        };
        Ok(SectorCipher { inner })
    }

    /// Encrypts `data` in place as consecutive sectors starting at
    /// `first_sector`. `data` must be a whole number of sectors and
    /// `sector_size` a multiple of the block length.
    pub fn encrypt_area(
        &self,
        data: &mut [u8],
        sector_size: usize,
        first_sector: u64,
    ) -> Result<(), LuksError> {
        check_area(data, sector_size)?;
        match &self.inner {
            Inner::Xts(x) => x.encrypt_area(data, sector_size, first_sector),
            _ => {
                for (i, sector) in data.chunks_mut(sector_size).enumerate() {
                    self.encrypt_one(sector, first_sector + i as u64);
                }
            }
        }
        Ok(())
    }

    /// Decrypts `data` in place; the inverse of [`encrypt_area`].
    ///
    /// [`encrypt_area`]: SectorCipher::encrypt_area
    pub fn decrypt_area(
        &self,
        data: &mut [u8],
        sector_size: usize,
        first_sector: u64,
    ) -> Result<(), LuksError> {
        check_area(data, sector_size)?;
        match &self.inner {
            Inner::Xts(x) => x.decrypt_area(data, sector_size, first_sector),
            _ => {
                for (i, sector) in data.chunks_mut(sector_size).enumerate() {
                    self.decrypt_one(sector, first_sector + i as u64);
                }
            }
        }
        Ok(())
    }

    fn encrypt_one(&self, sector: &mut [u8], sector_number: u64) {
        match &self.inner {
            Inner::Ecb(c) => {
                for block in sector.chunks_mut(BLOCK_LEN) {
                    c.encrypt_block(block);
                }
            }
            Inner::Cbc { cipher, wide_iv } => {
                let iv = plain_iv(sector_number, *wide_iv);
                cbc_encrypt(cipher, iv, sector);
            }
            Inner::CbcEssiv { cipher, essiv } => {
                let iv = essiv_iv(essiv, sector_number);
                cbc_encrypt(cipher, iv, sector);
            }
            Inner::Xts(_) => unreachable!("xts handled at area level"),
        }
    }

    fn decrypt_one(&self, sector: &mut [u8], sector_number: u64) {
        match &self.inner {
            Inner::Ecb(c) => {
                for block in sector.chunks_mut(BLOCK_LEN) {
                    c.decrypt_block(block);
                }
            }
            Inner::Cbc { cipher, wide_iv } => {
                let iv = plain_iv(sector_number, *wide_iv);
                cbc_decrypt(cipher, iv, sector);
            }
            Inner::CbcEssiv { cipher, essiv } => {
                let iv = essiv_iv(essiv, sector_number);
                cbc_decrypt(cipher, iv, sector);
            }
            Inner::Xts(_) => unreachable!("xts handled at area level"),
        }
    }
}

fn check_area(data: &[u8], sector_size: usize) -> Result<(), LuksError> {
    if sector_size == 0
        || sector_size % BLOCK_LEN != 0
        || data.len() % sector_size != 0
    {
        return Err(LuksError::InvalidLength);
    }
    Ok(())
}

/// Sector number as a little-endian IV block. `wide` keeps all 64
/// bits; otherwise the number is truncated to 32 bits first, matching
/// dm-crypt's `plain` generator.
fn plain_iv(sector_number: u64, wide: bool) -> [u8; BLOCK_LEN] {
    let n = if wide {
        sector_number
    } else {
        sector_number & 0xffff_ffff
    };
    let mut iv = [0u8; BLOCK_LEN];
    iv[..8].copy_from_slice(&n.to_le_bytes());
    iv
}

/// ESSIV: the sector-number block encrypted under the salt key.
fn essiv_iv(essiv: &AesVariant, sector_number: u64) -> [u8; BLOCK_LEN] {
    let mut iv = plain_iv(sector_number, true);
    essiv.encrypt_block(&mut iv);
    iv
}

/// ESSIV salt key: hash of the data key, truncated to the data key's
/// length, or cycled when the digest is shorter.
fn essiv_key(hash: HashAlg, key: &[u8]) -> Zeroizing<Vec<u8>> {
    let digest = Zeroizing::new(hash.digest(key));
    let mut out = Zeroizing::new(vec![0u8; key.len()]);
    for (i, b) in out.iter_mut().enumerate() {
        *b = digest[i % digest.len()];
    }
    out
}

fn cbc_encrypt(cipher: &AesVariant, iv: [u8; BLOCK_LEN], sector: &mut [u8]) {
    let mut prev = iv;
    for block in sector.chunks_mut(BLOCK_LEN) {
        for (b, p) in block.iter_mut().zip(prev.iter()) {
            *b ^= *p;
        }
        cipher.encrypt_block(block);
        prev.copy_from_slice(block);
    }
}

fn cbc_decrypt(cipher: &AesVariant, iv: [u8; BLOCK_LEN], sector: &mut [u8]) {
    let mut prev = iv;
    let mut saved = [0u8; BLOCK_LEN];
    for block in sector.chunks_mut(BLOCK_LEN) {
        saved.copy_from_slice(block);
        cipher.decrypt_block(block);
        for (b, p) in block.iter_mut().zip(prev.iter()) {
            *b ^= *p;
        }
        prev = saved;
    }
}
