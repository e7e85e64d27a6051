//! Volume unlock and the transparent sector transform.
//!
//! Unlock walks the enabled key slots in ascending order: stretch the
//! passphrase with the slot's salt and cost, read and decrypt the
//! slot's key material, AF-merge it into a candidate master key, and
//! check the candidate against the header's master-key digest. The
//! first verified candidate wins; the caller learns nothing about
//! which slots were tried or how close any of them came.
//!
//! The master key itself lives only long enough to derive one cipher
//! context per direction; every key buffer on every path out of here
//! is wrapped in `Zeroizing`.

use std::io;
use std::sync::atomic::AtomicBool;

use log::debug;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use zeroize::Zeroizing;

use crate::af;
use crate::cipher::{SectorCipher, SectorMode, BLOCK_LEN};
use crate::device::BlockDevice;
use crate::digest::HashAlg;
use crate::error::LuksError;
use crate::header::{
    stripe_region_sectors, KeySlot, SlotState, VolumeHeader, DEFAULT_STRIPES, LUKS_DIGEST_LEN,
    LUKS_PHDR_LEN, LUKS_SALT_LEN, SECTOR_LEN,
};
use crate::kdf;

/// Parameters for creating a new volume.
#[derive(Debug, Clone)]
pub struct FormatOptions {
    pub cipher_name: String,
    pub cipher_mode: String,
    pub hash_name: String,
    pub key_bytes: u32,
    /// PBKDF2 cost for key slots and the master-key digest.
    pub iterations: u32,
    pub stripes: u32,
    /// Volume UUID; generated when `None`.
    pub uuid: Option<String>,
}

impl Default for FormatOptions {
    fn default() -> Self {
        FormatOptions {
            cipher_name: "aes".into(),
            cipher_mode: "xts-plain64".into(),
            hash_name: "sha256".into(),
            key_bytes: 64,
            iterations: 10_000,
            stripes: DEFAULT_STRIPES,
            uuid: None,
        }
    }
}

/// The unlocked state: two independent cipher contexts derived from
/// the master key, which itself has already been zeroed by the time a
/// value of this type exists.
pub struct UnlockedVolume {
    read_cipher: SectorCipher,
    write_cipher: SectorCipher,
    payload_offset: u64,
}

impl UnlockedVolume {
    fn from_master_key(header: &VolumeHeader, master_key: &[u8]) -> Result<Self, LuksError> {
        Ok(UnlockedVolume {
            read_cipher: SectorCipher::new(&header.cipher_name, &header.cipher_mode, master_key)?,
            write_cipher: SectorCipher::new(&header.cipher_name, &header.cipher_mode, master_key)?,
            payload_offset: header.payload_offset as u64,
        })
    }

    pub fn payload_offset(&self) -> u64 {
        self.payload_offset
    }

    /// Decrypts payload sectors in place. `first_sector` is relative
    /// to the payload start; the IV is derived from it, never from the
    /// physical sector number.
    pub fn decrypt_area(
        &self,
        data: &mut [u8],
        sector_size: usize,
        first_sector: u64,
    ) -> Result<(), LuksError> {
        self.read_cipher.decrypt_area(data, sector_size, first_sector)
    }

    /// Encrypts payload sectors in place; counterpart of
    /// [`decrypt_area`].
    ///
    /// [`decrypt_area`]: UnlockedVolume::decrypt_area
    pub fn encrypt_area(
        &self,
        data: &mut [u8],
        sector_size: usize,
        first_sector: u64,
    ) -> Result<(), LuksError> {
        self.write_cipher.encrypt_area(data, sector_size, first_sector)
    }
}

fn header_sectors() -> u64 {
    (LUKS_PHDR_LEN as u64).div_ceil(SECTOR_LEN as u64)
}

fn check_device<D: BlockDevice>(dev: &D) -> Result<(), LuksError> {
    let ss = dev.sector_size();
    if ss != SECTOR_LEN || ss % BLOCK_LEN != 0 {
        return Err(LuksError::UnsupportedSectorSize(ss));
    }
    Ok(())
}

/// Reads and validates the header from the start of the device.
pub fn read_header<D: BlockDevice>(dev: &mut D) -> Result<VolumeHeader, LuksError> {
    check_device(dev)?;
    let mut buf = vec![0u8; header_sectors() as usize * SECTOR_LEN];
    dev.read_sectors(0, &mut buf)?;
    VolumeHeader::parse(&buf)
}

fn write_header<D: BlockDevice>(dev: &mut D, header: &VolumeHeader) -> Result<(), LuksError> {
    let mut buf = header.serialize()?;
    buf.resize(header_sectors() as usize * SECTOR_LEN, 0);
    dev.write_sectors(0, &buf)?;
    Ok(())
}

/// Tries every enabled slot and returns the verified master key.
///
/// The return value is the only copy; callers must keep it scoped as
/// tightly as possible.
fn recover_master_key<D: BlockDevice>(
    dev: &mut D,
    header: &VolumeHeader,
    passphrase: &[u8],
    cancel: Option<&AtomicBool>,
) -> Result<Zeroizing<Vec<u8>>, LuksError> {
    let hash = HashAlg::from_name(&header.hash_name)?;
    let mode = SectorMode::from_name(&header.cipher_mode)?;
    let key_bytes = header.key_bytes as usize;

    for (idx, slot) in header.enabled_slots() {
        debug!("trying key slot {idx}");
        let slot_key = kdf::pbkdf2_with_cancel(
            passphrase,
            &slot.salt,
            slot.iterations,
            hash,
            key_bytes,
            cancel,
        )?;

        let region_sectors = stripe_region_sectors(header.key_bytes, slot.stripes);
        let mut material =
            Zeroizing::new(vec![0u8; region_sectors as usize * SECTOR_LEN]);
        dev.read_sectors(slot.key_material_offset as u64, &mut material)?;

        // Key material is wrapped with the volume's own cipher spec,
        // keyed by the slot key, sector IVs counted from the start of
        // the slot's region.
        let slot_cipher = SectorCipher::with_mode(mode, &slot_key)?;
        slot_cipher.decrypt_area(&mut material, SECTOR_LEN, 0)?;
        material.truncate(key_bytes * slot.stripes as usize);

        let candidate = af::merge(&material, slot.stripes, hash)?;
        let digest = kdf::pbkdf2_with_cancel(
            &candidate,
            &header.mk_digest_salt,
            header.mk_digest_iterations,
            hash,
            LUKS_DIGEST_LEN,
            cancel,
        )?;
        if ct_eq(&digest, &header.mk_digest) {
            debug!("key slot {idx} verified");
            return Ok(candidate);
        }
    }

    Err(LuksError::NoMatchingKeySlot)
}

/// Unlocks the volume with a passphrase.
pub fn unlock<D: BlockDevice>(
    dev: &mut D,
    header: &VolumeHeader,
    passphrase: &[u8],
) -> Result<UnlockedVolume, LuksError> {
    unlock_with_cancel(dev, header, passphrase, None)
}

/// Unlocks the volume, polling `cancel` during key stretching.
pub fn unlock_with_cancel<D: BlockDevice>(
    dev: &mut D,
    header: &VolumeHeader,
    passphrase: &[u8],
    cancel: Option<&AtomicBool>,
) -> Result<UnlockedVolume, LuksError> {
    check_device(dev)?;
    let master_key = recover_master_key(dev, header, passphrase, cancel)?;
    // The master key is dropped (and zeroed) as soon as the two
    // contexts exist.
    UnlockedVolume::from_master_key(header, &master_key)
}

/// Creates a new volume on `dev` and enables key slot 0 with
/// `passphrase`. Returns the written header.
pub fn format_volume<D: BlockDevice>(
    dev: &mut D,
    opts: &FormatOptions,
    passphrase: &[u8],
) -> Result<VolumeHeader, LuksError> {
    check_device(dev)?;
    if opts.iterations < 1 {
        return Err(LuksError::InvalidIterationCount);
    }
    let hash = HashAlg::from_name(&opts.hash_name)?;
    let mut rng = StdRng::from_entropy();

    let mut master_key = Zeroizing::new(vec![0u8; opts.key_bytes as usize]);
    rng.fill_bytes(&mut master_key);
    let mut mk_digest_salt = [0u8; LUKS_SALT_LEN];
    rng.fill_bytes(&mut mk_digest_salt);
    let digest = kdf::pbkdf2(
        &master_key,
        &mk_digest_salt,
        opts.iterations,
        hash,
        LUKS_DIGEST_LEN,
    )?;
    let mut mk_digest = [0u8; LUKS_DIGEST_LEN];
    mk_digest.copy_from_slice(&digest);

    let region = stripe_region_sectors(opts.key_bytes, opts.stripes);
    let hs = header_sectors() as u32;
    let mut slots = [KeySlot::unconfigured(0, 0); crate::header::LUKS_NUM_SLOTS];
    for (i, slot) in slots.iter_mut().enumerate() {
        *slot = KeySlot::unconfigured(hs + i as u32 * region, opts.stripes);
    }
    let payload_offset = hs + crate::header::LUKS_NUM_SLOTS as u32 * region;

    let mut header = VolumeHeader {
        cipher_name: opts.cipher_name.clone(),
        cipher_mode: opts.cipher_mode.clone(),
        hash_name: opts.hash_name.clone(),
        payload_offset,
        key_bytes: opts.key_bytes,
        mk_digest,
        mk_digest_salt,
        mk_digest_iterations: opts.iterations,
        uuid: opts.uuid.clone().unwrap_or_else(|| generate_uuid(&mut rng)),
        slots,
    };
    header.validate()?;

    if (payload_offset as u64) >= dev.total_sectors() {
        return Err(LuksError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            "device too small for key material and payload",
        )));
    }

    write_header(dev, &header)?;
    write_keyslot(dev, &mut header, 0, passphrase, &master_key, opts.iterations)?;
    Ok(header)
}

/// Adds a passphrase to the first never-configured slot. The master
/// key is recovered via `existing_passphrase` and discarded again
/// before returning. Returns the new slot's index.
pub fn add_keyslot<D: BlockDevice>(
    dev: &mut D,
    existing_passphrase: &[u8],
    new_passphrase: &[u8],
    iterations: u32,
) -> Result<usize, LuksError> {
    if iterations < 1 {
        return Err(LuksError::InvalidIterationCount);
    }
    let mut header = read_header(dev)?;
    let master_key = recover_master_key(dev, &header, existing_passphrase, None)?;
    let idx = header
        .slots
        .iter()
        .position(|s| s.state == SlotState::Unconfigured)
        .ok_or(LuksError::NoFreeKeySlot)?;
    write_keyslot(dev, &mut header, idx, new_passphrase, &master_key, iterations)?;
    debug!("enabled key slot {idx}");
    Ok(idx)
}

/// Destroys a key slot: overwrites its stripe region with fresh random
/// bytes and marks it disabled. The diffusion of the AF split makes
/// the old material unrecoverable even if parts of the overwrite are
/// later undone.
pub fn wipe_keyslot<D: BlockDevice>(dev: &mut D, slot_index: usize) -> Result<(), LuksError> {
    let mut header = read_header(dev)?;
    let slot = header
        .slots
        .get(slot_index)
        .ok_or_else(|| LuksError::CorruptSlotTable(format!("no slot {slot_index}")))?;
    if slot.state == SlotState::Unconfigured {
        return Err(LuksError::CorruptSlotTable(format!(
            "slot {slot_index} holds no key material"
        )));
    }

    let region_sectors = stripe_region_sectors(header.key_bytes, slot.stripes);
    let mut garbage = vec![0u8; region_sectors as usize * SECTOR_LEN];
    StdRng::from_entropy().fill_bytes(&mut garbage);
    dev.write_sectors(slot.key_material_offset as u64, &garbage)?;

    let offset = slot.key_material_offset;
    let stripes = slot.stripes;
    header.slots[slot_index] = KeySlot {
        state: SlotState::Disabled,
        iterations: 0,
        salt: [0u8; LUKS_SALT_LEN],
        key_material_offset: offset,
        stripes,
    };
    write_header(dev, &header)?;
    debug!("wiped key slot {slot_index}");
    Ok(())
}

fn write_keyslot<D: BlockDevice>(
    dev: &mut D,
    header: &mut VolumeHeader,
    idx: usize,
    passphrase: &[u8],
    master_key: &[u8],
    iterations: u32,
) -> Result<(), LuksError> {
    let hash = HashAlg::from_name(&header.hash_name)?;
    let mode = SectorMode::from_name(&header.cipher_mode)?;
    let slot = header.slots[idx];
    if slot.stripes < 1 {
        return Err(LuksError::CorruptSlotTable(format!(
            "slot {idx} has no stripe layout"
        )));
    }

    let mut rng = StdRng::from_entropy();
    let mut salt = [0u8; LUKS_SALT_LEN];
    rng.fill_bytes(&mut salt);

    let slot_key = kdf::pbkdf2(passphrase, &salt, iterations, hash, header.key_bytes as usize)?;
    let mut material = Zeroizing::new(af::split(master_key, slot.stripes, hash)?);
    let region_bytes = stripe_region_sectors(header.key_bytes, slot.stripes) as usize * SECTOR_LEN;
    material.resize(region_bytes, 0);

    let slot_cipher = SectorCipher::with_mode(mode, &slot_key)?;
    slot_cipher.encrypt_area(&mut material, SECTOR_LEN, 0)?;
    dev.write_sectors(slot.key_material_offset as u64, &material)?;

    header.slots[idx] = KeySlot {
        state: SlotState::Enabled,
        iterations,
        salt,
        key_material_offset: slot.key_material_offset,
        stripes: slot.stripes,
    };
    write_header(dev, header)
}

/// Constant-structure comparison; runtime does not depend on where the
/// inputs differ.
fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn generate_uuid(rng: &mut StdRng) -> String {
    let mut bytes = [0u8; 16];
    rng.fill_bytes(&mut bytes);
    // RFC 4122 version 4 / variant 1 bits.
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    let h = |r: std::ops::Range<usize>| {
        bytes[r].iter().map(|b| format!("{b:02x}")).collect::<String>()
    };
    format!(
        "{}-{}-{}-{}-{}",
        h(0..4),
        h(4..6),
        h(6..8),
        h(8..10),
        h(10..16)
    )
}

/// The decrypted view of an unlocked volume, itself a [`BlockDevice`].
///
/// Sector 0 of this device is the first payload sector; the header and
/// key material are not addressable through it.
pub struct CryptVolume<D: BlockDevice> {
    device: D,
    header: VolumeHeader,
    unlocked: UnlockedVolume,
}

impl<D: BlockDevice> CryptVolume<D> {
    /// Reads the header, unlocks with `passphrase`, and takes
    /// ownership of the device.
    pub fn open(device: D, passphrase: &[u8]) -> Result<Self, LuksError> {
        Self::open_with_cancel(device, passphrase, None)
    }

    pub fn open_with_cancel(
        mut device: D,
        passphrase: &[u8],
        cancel: Option<&AtomicBool>,
    ) -> Result<Self, LuksError> {
        let header = read_header(&mut device)?;
        let unlocked = unlock_with_cancel(&mut device, &header, passphrase, cancel)?;
        Ok(CryptVolume {
            device,
            header,
            unlocked,
        })
    }

    pub fn header(&self) -> &VolumeHeader {
        &self.header
    }

    /// Releases the underlying device; cipher contexts are zeroed on
    /// drop.
    pub fn into_inner(self) -> D {
        self.device
    }
}

fn fatal(e: LuksError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, e.to_string())
}

impl<D: BlockDevice> BlockDevice for CryptVolume<D> {
    fn sector_size(&self) -> usize {
        self.device.sector_size()
    }

    fn total_sectors(&self) -> u64 {
        self.device
            .total_sectors()
            .saturating_sub(self.unlocked.payload_offset)
    }

    fn read_sectors(&mut self, first_sector: u64, buf: &mut [u8]) -> io::Result<()> {
        self.device
            .read_sectors(self.unlocked.payload_offset + first_sector, buf)?;
        self.unlocked
            .decrypt_area(buf, self.device.sector_size(), first_sector)
            .map_err(fatal)
    }

    fn write_sectors(&mut self, first_sector: u64, data: &[u8]) -> io::Result<()> {
        let mut buf = data.to_vec();
        self.unlocked
            .encrypt_area(&mut buf, self.device.sector_size(), first_sector)
            .map_err(fatal)?;
        self.device
            .write_sectors(self.unlocked.payload_offset + first_sector, &buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ct_eq_basic() {
        assert!(ct_eq(b"abcd", b"abcd"));
        assert!(!ct_eq(b"abcd", b"abce"));
        assert!(!ct_eq(b"abcd", b"abc"));
        assert!(ct_eq(b"", b""));
    }

    #[test]
    fn generated_uuid_shape() {
        let uuid = generate_uuid(&mut StdRng::from_entropy());
        assert_eq!(uuid.len(), 36);
        let parts: Vec<&str> = uuid.split('-').collect();
        assert_eq!(
            parts.iter().map(|p| p.len()).collect::<Vec<_>>(),
            vec![8, 4, 4, 4, 12]
        );
        assert!(parts[2].starts_with('4'));
    }
}
