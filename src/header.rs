//! The LUKS1 partition header: a 592-byte structure at the start of
//! the device holding the cipher/hash selection, the master-key
//! digest, and eight key-slot descriptors.
//!
//! All integers are big-endian on disk; name fields are fixed-width
//! and null-padded. Parsing is pure; `serialize` is its exact inverse
//! and `parse(serialize(h)) == h` holds for any valid header.

use byteorder::{BigEndian, ByteOrder};

use crate::cipher::{check_cipher_name, SectorMode};
use crate::digest::HashAlg;
use crate::error::LuksError;

/// Magic signature: "LUKS\xBA\xBE".
pub const LUKS_MAGIC: [u8; 6] = *b"LUKS\xBA\xBE";
/// The only supported on-disk version.
pub const LUKS_VERSION: u16 = 1;
/// Number of key-slot descriptors in the header.
pub const LUKS_NUM_SLOTS: usize = 8;
/// Width of the cipher-name, cipher-mode and hash-name fields.
pub const LUKS_NAME_LEN: usize = 32;
/// Master-key digest length (PBKDF2 output).
pub const LUKS_DIGEST_LEN: usize = 20;
/// Salt length, for key slots and the master-key digest alike.
pub const LUKS_SALT_LEN: usize = 32;
/// UUID field width.
pub const LUKS_UUID_LEN: usize = 40;
/// Total serialized header length.
pub const LUKS_PHDR_LEN: usize = 592;
/// LUKS1 layout math is fixed to 512-byte sectors.
pub const SECTOR_LEN: usize = 512;
/// Conventional anti-forensic stripe count for new key slots.
pub const DEFAULT_STRIPES: u32 = 4000;

const SLOT_ENABLED: u32 = 0x00AC_71F3;
const SLOT_DISABLED: u32 = 0x0000_DEAD;
const SLOT_UNCONFIGURED: u32 = 0x0000_0000;

const SLOT_DESC_LEN: usize = 48;
const SLOT_TABLE_OFFSET: usize = 208;

/// Key-slot activation state.
///
/// `Unconfigured` marks a slot that never held key material, as
/// opposed to `Disabled`, which marks one that was wiped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Enabled,
    Disabled,
    Unconfigured,
}

impl SlotState {
    fn from_marker(marker: u32, slot: usize) -> Result<Self, LuksError> {
        match marker {
            SLOT_ENABLED => Ok(SlotState::Enabled),
            SLOT_DISABLED => Ok(SlotState::Disabled),
            SLOT_UNCONFIGURED => Ok(SlotState::Unconfigured),
            other => Err(LuksError::CorruptSlotTable(format!(
                "slot {slot} has invalid state marker {other:#010x}"
            ))),
        }
    }

    fn marker(&self) -> u32 {
        match self {
            SlotState::Enabled => SLOT_ENABLED,
            SlotState::Disabled => SLOT_DISABLED,
            SlotState::Unconfigured => SLOT_UNCONFIGURED,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeySlot {
    pub state: SlotState,
    /// PBKDF2 round count for this slot's passphrase.
    pub iterations: u32,
    pub salt: [u8; LUKS_SALT_LEN],
    /// First sector of this slot's anti-forensic key material.
    pub key_material_offset: u32,
    /// Anti-forensic stripe count.
    pub stripes: u32,
}

impl KeySlot {
    pub fn unconfigured(key_material_offset: u32, stripes: u32) -> Self {
        KeySlot {
            state: SlotState::Unconfigured,
            iterations: 0,
            salt: [0u8; LUKS_SALT_LEN],
            key_material_offset,
            stripes,
        }
    }
}

/// Sectors occupied by one slot's AF-split key material.
pub(crate) fn stripe_region_sectors(key_bytes: u32, stripes: u32) -> u32 {
    let bytes = key_bytes as u64 * stripes as u64;
    bytes.div_ceil(SECTOR_LEN as u64) as u32
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeHeader {
    pub cipher_name: String,
    pub cipher_mode: String,
    pub hash_name: String,
    /// First sector of the encrypted payload.
    pub payload_offset: u32,
    /// Master-key length in bytes.
    pub key_bytes: u32,
    pub mk_digest: [u8; LUKS_DIGEST_LEN],
    pub mk_digest_salt: [u8; LUKS_SALT_LEN],
    pub mk_digest_iterations: u32,
    pub uuid: String,
    pub slots: [KeySlot; LUKS_NUM_SLOTS],
}

impl VolumeHeader {
    /// Parses and validates a serialized header.
    pub fn parse(bytes: &[u8]) -> Result<Self, LuksError> {
        if bytes.len() < LUKS_PHDR_LEN || bytes[..6] != LUKS_MAGIC {
            return Err(LuksError::BadMagic);
        }
        let version = BigEndian::read_u16(&bytes[6..8]);
        if version != LUKS_VERSION {
            return Err(LuksError::UnsupportedVersion(version));
        }

        let cipher_name = read_name(&bytes[8..40]);
        let cipher_mode = read_name(&bytes[40..72]);
        let hash_name = read_name(&bytes[72..104]);
        let payload_offset = BigEndian::read_u32(&bytes[104..108]);
        let key_bytes = BigEndian::read_u32(&bytes[108..112]);
        let mut mk_digest = [0u8; LUKS_DIGEST_LEN];
        mk_digest.copy_from_slice(&bytes[112..132]);
        let mut mk_digest_salt = [0u8; LUKS_SALT_LEN];
        mk_digest_salt.copy_from_slice(&bytes[132..164]);
        let mk_digest_iterations = BigEndian::read_u32(&bytes[164..168]);
        let uuid = read_name(&bytes[168..208]);

        let mut slots = [KeySlot::unconfigured(0, 0); LUKS_NUM_SLOTS];
        for (i, slot) in slots.iter_mut().enumerate() {
            let d = &bytes[SLOT_TABLE_OFFSET + i * SLOT_DESC_LEN..][..SLOT_DESC_LEN];
            let state = SlotState::from_marker(BigEndian::read_u32(&d[0..4]), i)?;
            let iterations = BigEndian::read_u32(&d[4..8]);
            let mut salt = [0u8; LUKS_SALT_LEN];
            salt.copy_from_slice(&d[8..40]);
            let key_material_offset = BigEndian::read_u32(&d[40..44]);
            let stripes = BigEndian::read_u32(&d[44..48]);
            *slot = KeySlot {
                state,
                iterations,
                salt,
                key_material_offset,
                stripes,
            };
        }

        let header = VolumeHeader {
            cipher_name,
            cipher_mode,
            hash_name,
            payload_offset,
            key_bytes,
            mk_digest,
            mk_digest_salt,
            mk_digest_iterations,
            uuid,
            slots,
        };
        header.validate()?;
        Ok(header)
    }

    /// Serializes to the on-disk layout; the inverse of [`parse`].
    ///
    /// [`parse`]: VolumeHeader::parse
    pub fn serialize(&self) -> Result<Vec<u8>, LuksError> {
        let mut out = vec![0u8; LUKS_PHDR_LEN];
        out[..6].copy_from_slice(&LUKS_MAGIC);
        BigEndian::write_u16(&mut out[6..8], LUKS_VERSION);
        write_name(&mut out[8..40], &self.cipher_name)?;
        write_name(&mut out[40..72], &self.cipher_mode)?;
        write_name(&mut out[72..104], &self.hash_name)?;
        BigEndian::write_u32(&mut out[104..108], self.payload_offset);
        BigEndian::write_u32(&mut out[108..112], self.key_bytes);
        out[112..132].copy_from_slice(&self.mk_digest);
        out[132..164].copy_from_slice(&self.mk_digest_salt);
        BigEndian::write_u32(&mut out[164..168], self.mk_digest_iterations);
        write_name(&mut out[168..208], &self.uuid)?;

        for (i, slot) in self.slots.iter().enumerate() {
            let d = &mut out[SLOT_TABLE_OFFSET + i * SLOT_DESC_LEN..][..SLOT_DESC_LEN];
            BigEndian::write_u32(&mut d[0..4], slot.state.marker());
            BigEndian::write_u32(&mut d[4..8], slot.iterations);
            d[8..40].copy_from_slice(&slot.salt);
            BigEndian::write_u32(&mut d[40..44], slot.key_material_offset);
            BigEndian::write_u32(&mut d[44..48], slot.stripes);
        }
        Ok(out)
    }

    /// Checks algorithm names, key size, iteration counts, and that
    /// key-material regions stay clear of the header, of one another
    /// and of the payload.
    pub fn validate(&self) -> Result<(), LuksError> {
        check_cipher_name(&self.cipher_name)?;
        let mode = SectorMode::from_name(&self.cipher_mode)?;
        HashAlg::from_name(&self.hash_name)?;

        // Cheap probe with an all-zero key, just for the size rules.
        let probe = vec![0u8; self.key_bytes as usize];
        crate::cipher::SectorCipher::with_mode(mode, &probe)?;

        if self.mk_digest_iterations < 1 {
            return Err(LuksError::InvalidIterationCount);
        }

        let header_sectors = (LUKS_PHDR_LEN as u32).div_ceil(SECTOR_LEN as u32);
        let mut regions: Vec<(u64, u64)> = Vec::new();
        for (i, slot) in self.slots.iter().enumerate() {
            if slot.state == SlotState::Unconfigured {
                continue;
            }
            if slot.state == SlotState::Enabled && slot.iterations < 1 {
                return Err(LuksError::CorruptSlotTable(format!(
                    "active slot {i} has a zero iteration count"
                )));
            }
            if slot.stripes < 1 {
                return Err(LuksError::CorruptSlotTable(format!(
                    "slot {i} has a zero stripe count"
                )));
            }
            if slot.key_material_offset < header_sectors {
                return Err(LuksError::OverlappingRegions);
            }
            let start = slot.key_material_offset as u64;
            let len = stripe_region_sectors(self.key_bytes, slot.stripes) as u64;
            regions.push((start, start + len));
        }

        regions.sort_unstable();
        for pair in regions.windows(2) {
            if pair[0].1 > pair[1].0 {
                return Err(LuksError::OverlappingRegions);
            }
        }
        if let Some(&(_, end)) = regions.last() {
            if (self.payload_offset as u64) < end {
                return Err(LuksError::OverlappingRegions);
            }
        }
        if self.payload_offset < header_sectors {
            return Err(LuksError::OverlappingRegions);
        }
        Ok(())
    }

    /// Enabled slots in ascending index order, the order unlock tries
    /// them in.
    pub fn enabled_slots(&self) -> impl Iterator<Item = (usize, &KeySlot)> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.state == SlotState::Enabled)
    }
}

fn read_name(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

// A name may fill its field exactly, with no null terminator; readers
// bound the scan by the field width.
fn write_name(field: &mut [u8], name: &str) -> Result<(), LuksError> {
    let bytes = name.as_bytes();
    if bytes.len() > field.len() {
        return Err(LuksError::InvalidLength);
    }
    field[..bytes.len()].copy_from_slice(bytes);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> VolumeHeader {
        let key_bytes = 32u32;
        let stripes = DEFAULT_STRIPES;
        let region = stripe_region_sectors(key_bytes, stripes);
        let header_sectors = (LUKS_PHDR_LEN as u32).div_ceil(SECTOR_LEN as u32);

        let mut slots = [KeySlot::unconfigured(0, 0); LUKS_NUM_SLOTS];
        for (i, slot) in slots.iter_mut().enumerate() {
            let offset = header_sectors + i as u32 * region;
            *slot = match i {
                0 | 3 => KeySlot {
                    state: SlotState::Enabled,
                    iterations: 2000 + i as u32,
                    salt: [i as u8 + 1; LUKS_SALT_LEN],
                    key_material_offset: offset,
                    stripes,
                },
                1 => KeySlot {
                    state: SlotState::Disabled,
                    iterations: 0,
                    salt: [0; LUKS_SALT_LEN],
                    key_material_offset: offset,
                    stripes,
                },
                _ => KeySlot::unconfigured(offset, stripes),
            };
        }

        VolumeHeader {
            cipher_name: "aes".into(),
            cipher_mode: "xts-plain64".into(),
            hash_name: "sha256".into(),
            payload_offset: header_sectors + LUKS_NUM_SLOTS as u32 * region,
            key_bytes,
            mk_digest: [0xd1; LUKS_DIGEST_LEN],
            mk_digest_salt: [0xa5; LUKS_SALT_LEN],
            mk_digest_iterations: 1000,
            uuid: "7b94ff43-2a04-4c44-b7b3-0c2f1a6a20e9".into(),
            slots,
        }
    }

    #[test]
    fn serialize_parse_roundtrip() {
        let header = sample_header();
        let bytes = header.serialize().unwrap();
        assert_eq!(bytes.len(), LUKS_PHDR_LEN);
        let parsed = VolumeHeader::parse(&bytes).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn unterminated_uuid_field_roundtrips() {
        let mut bytes = sample_header().serialize().unwrap();
        // Fill the uuid field completely, no null terminator.
        bytes[168..208].copy_from_slice(&[b'a'; LUKS_UUID_LEN]);
        let header = VolumeHeader::parse(&bytes).unwrap();
        assert_eq!(header.uuid.len(), LUKS_UUID_LEN);
        let out = header.serialize().unwrap();
        assert_eq!(out, bytes);
    }

    #[test]
    fn bad_magic_rejected() {
        let mut bytes = sample_header().serialize().unwrap();
        bytes[0] = b'X';
        assert!(matches!(VolumeHeader::parse(&bytes), Err(LuksError::BadMagic)));
        assert!(matches!(
            VolumeHeader::parse(&bytes[..100]),
            Err(LuksError::BadMagic)
        ));
    }

    #[test]
    fn unsupported_version_rejected() {
        let mut bytes = sample_header().serialize().unwrap();
        BigEndian::write_u16(&mut bytes[6..8], 2);
        assert!(matches!(
            VolumeHeader::parse(&bytes),
            Err(LuksError::UnsupportedVersion(2))
        ));
    }

    #[test]
    fn unknown_algorithms_rejected() {
        let mut h = sample_header();
        h.cipher_name = "twofish".into();
        let err = VolumeHeader::parse(&h.serialize().unwrap()).unwrap_err();
        assert!(matches!(err, LuksError::UnsupportedCipher(_)));

        let mut h = sample_header();
        h.cipher_mode = "cbc-rot13".into();
        let err = VolumeHeader::parse(&h.serialize().unwrap()).unwrap_err();
        assert!(matches!(err, LuksError::UnsupportedCipherMode(_)));

        let mut h = sample_header();
        h.hash_name = "md5".into();
        let err = VolumeHeader::parse(&h.serialize().unwrap()).unwrap_err();
        assert!(matches!(err, LuksError::UnsupportedHash(_)));
    }

    #[test]
    fn key_size_must_match_mode() {
        let mut h = sample_header();
        h.key_bytes = 40;
        let err = VolumeHeader::parse(&h.serialize().unwrap()).unwrap_err();
        assert!(matches!(err, LuksError::InvalidKeySize));
    }

    #[test]
    fn invalid_slot_marker_rejected() {
        let mut bytes = sample_header().serialize().unwrap();
        BigEndian::write_u32(&mut bytes[SLOT_TABLE_OFFSET..SLOT_TABLE_OFFSET + 4], 0x1234);
        let err = VolumeHeader::parse(&bytes).unwrap_err();
        assert!(matches!(err, LuksError::CorruptSlotTable(_)));
    }

    #[test]
    fn overlapping_slot_regions_rejected() {
        let mut h = sample_header();
        h.slots[3].key_material_offset = h.slots[0].key_material_offset + 1;
        let err = VolumeHeader::parse(&h.serialize().unwrap()).unwrap_err();
        assert!(matches!(err, LuksError::OverlappingRegions));
    }

    #[test]
    fn payload_inside_key_material_rejected() {
        let mut h = sample_header();
        h.payload_offset = h.slots[3].key_material_offset;
        let err = VolumeHeader::parse(&h.serialize().unwrap()).unwrap_err();
        assert!(matches!(err, LuksError::OverlappingRegions));
    }

    #[test]
    fn active_slot_with_zero_iterations_rejected() {
        let mut h = sample_header();
        h.slots[0].iterations = 0;
        let err = VolumeHeader::parse(&h.serialize().unwrap()).unwrap_err();
        assert!(matches!(err, LuksError::CorruptSlotTable(_)));
    }

    #[test]
    fn enabled_slot_iteration_order() {
        let h = sample_header();
        let indexes: Vec<usize> = h.enabled_slots().map(|(i, _)| i).collect();
        assert_eq!(indexes, vec![0, 3]);
    }
}
