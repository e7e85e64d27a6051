use thiserror::Error;

/// Errors produced by header parsing, key-slot operations and the
/// sector transform.
///
/// Format errors are fatal for the volume; `NoMatchingKeySlot` is the
/// one retryable authentication failure and deliberately carries no
/// per-slot detail.
#[derive(Error, Debug)]
pub enum LuksError {
    #[error("not a LUKS volume (bad magic)")]
    BadMagic,
    #[error("unsupported LUKS version: {0}")]
    UnsupportedVersion(u16),
    #[error("unsupported cipher: {0}")]
    UnsupportedCipher(String),
    #[error("unsupported cipher mode: {0}")]
    UnsupportedCipherMode(String),
    #[error("unsupported hash: {0}")]
    UnsupportedHash(String),
    #[error("corrupt key-slot table: {0}")]
    CorruptSlotTable(String),
    #[error("key-slot or payload regions overlap")]
    OverlappingRegions,
    #[error("key size does not match cipher/mode")]
    InvalidKeySize,
    #[error("PBKDF2 iteration count must be at least 1")]
    InvalidIterationCount,
    #[error("unsupported device sector size: {0}")]
    UnsupportedSectorSize(usize),
    #[error("buffer length is not a multiple of the cipher block size")]
    InvalidLength,
    #[error("no key slot matches the supplied passphrase")]
    NoMatchingKeySlot,
    #[error("all key slots are in use")]
    NoFreeKeySlot,
    #[error("operation cancelled")]
    Cancelled,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
