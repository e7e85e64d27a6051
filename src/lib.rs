//! LUKS1 volume encryption core.
//!
//! The crate turns a raw [`BlockDevice`] holding a LUKS1 volume into a
//! decrypted block device, and creates such volumes in the first
//! place. The pieces stack the way the on-disk format does:
//!
//! * [`digest`] and [`kdf`]: the hash/HMAC engines and PBKDF2 key
//!   stretching.
//! * [`cipher`]: AES sector encryption with ECB, CBC (plain, plain64,
//!   ESSIV) and XTS IV schemes.
//! * [`af`]: anti-forensic splitting of key-slot material.
//! * [`header`]: the 592-byte partition header and its key-slot table.
//! * [`volume`]: unlock, format, key-slot management, and
//!   [`CryptVolume`], the decrypted view.
//!
//! ```no_run
//! use luksblk::{BlockDevice, CryptVolume, FileDevice};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let file = std::fs::OpenOptions::new()
//!     .read(true)
//!     .write(true)
//!     .open("volume.img")?;
//! let dev = FileDevice::new(file, 512)?;
//! let mut vol = CryptVolume::open(dev, b"passphrase")?;
//! let mut sector = vec![0u8; vol.sector_size()];
//! vol.read_sectors(0, &mut sector)?;
//! # Ok(())
//! # }
//! ```
//!
//! All key material is held in [`zeroize::Zeroizing`] buffers and
//! wiped when dropped.

pub mod af;
pub mod cipher;
pub mod device;
pub mod digest;
pub mod error;
pub mod header;
pub mod kdf;
pub mod volume;

pub use cipher::{SectorCipher, SectorMode};
pub use device::{BlockDevice, FileDevice, MemDevice};
pub use digest::HashAlg;
pub use error::LuksError;
pub use header::{KeySlot, SlotState, VolumeHeader};
pub use volume::{
    add_keyslot, format_volume, read_header, unlock, unlock_with_cancel, wipe_keyslot,
    CryptVolume, FormatOptions, UnlockedVolume,
};
