//! The block-device contract the crypto core sits between.
//!
//! The same trait is consumed below (the raw disk holding header, key
//! material and ciphertext) and exposed above (the decrypted payload
//! presented by [`CryptVolume`]), so an unlocked volume stacks like
//! any other block device.
//!
//! [`CryptVolume`]: crate::volume::CryptVolume

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};

/// Sector-addressed storage. Buffer lengths must be whole multiples of
/// [`sector_size`].
///
/// [`sector_size`]: BlockDevice::sector_size
pub trait BlockDevice {
    fn sector_size(&self) -> usize;
    fn total_sectors(&self) -> u64;
    fn read_sectors(&mut self, first_sector: u64, buf: &mut [u8]) -> io::Result<()>;
    fn write_sectors(&mut self, first_sector: u64, data: &[u8]) -> io::Result<()>;
}

fn check_range(
    first_sector: u64,
    len: usize,
    sector_size: usize,
    total_sectors: u64,
) -> io::Result<()> {
    if sector_size == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "sector size must be nonzero",
        ));
    }
    if len % sector_size != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "buffer is not a whole number of sectors",
        ));
    }
    let count = (len / sector_size) as u64;
    if first_sector.checked_add(count).map_or(true, |end| end > total_sectors) {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "sector range past end of device",
        ));
    }
    Ok(())
}

/// An in-memory device, for tests and fixtures.
pub struct MemDevice {
    sector_size: usize,
    total_sectors: u64,
    data: Vec<u8>,
}

impl MemDevice {
    pub fn new(sector_size: usize, total_sectors: u64) -> Self {
        MemDevice {
            sector_size,
            total_sectors,
            data: vec![0u8; sector_size * total_sectors as usize],
        }
    }

    /// Raw backing bytes, for inspecting what actually hit "disk".
    pub fn raw(&self) -> &[u8] {
        &self.data
    }
}

impl BlockDevice for MemDevice {
    fn sector_size(&self) -> usize {
        self.sector_size
    }

    fn total_sectors(&self) -> u64 {
        self.total_sectors
    }

    fn read_sectors(&mut self, first_sector: u64, buf: &mut [u8]) -> io::Result<()> {
        check_range(first_sector, buf.len(), self.sector_size, self.total_sectors())?;
        let start = first_sector as usize * self.sector_size;
        buf.copy_from_slice(&self.data[start..start + buf.len()]);
        Ok(())
    }

    fn write_sectors(&mut self, first_sector: u64, data: &[u8]) -> io::Result<()> {
        check_range(first_sector, data.len(), self.sector_size, self.total_sectors())?;
        let start = first_sector as usize * self.sector_size;
        self.data[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }
}

/// A file-backed device (disk image or raw block node).
pub struct FileDevice {
    file: File,
    sector_size: usize,
    total_sectors: u64,
}

impl FileDevice {
    pub fn new(file: File, sector_size: usize) -> io::Result<Self> {
        if sector_size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "sector size must be nonzero",
            ));
        }
        let len = file.metadata()?.len();
        Ok(FileDevice {
            file,
            sector_size,
            total_sectors: len / sector_size as u64,
        })
    }
}

impl BlockDevice for FileDevice {
    fn sector_size(&self) -> usize {
        self.sector_size
    }

    fn total_sectors(&self) -> u64 {
        self.total_sectors
    }

    fn read_sectors(&mut self, first_sector: u64, buf: &mut [u8]) -> io::Result<()> {
        check_range(first_sector, buf.len(), self.sector_size, self.total_sectors)?;
        self.file
            .seek(SeekFrom::Start(first_sector * self.sector_size as u64))?;
        self.file.read_exact(buf)
    }

    fn write_sectors(&mut self, first_sector: u64, data: &[u8]) -> io::Result<()> {
        check_range(first_sector, data.len(), self.sector_size, self.total_sectors)?;
        self.file
            .seek(SeekFrom::Start(first_sector * self.sector_size as u64))?;
        self.file.write_all(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_device_roundtrip() {
        let mut dev = MemDevice::new(512, 8);
        let data = vec![0x5a_u8; 1024];
        dev.write_sectors(2, &data).unwrap();
        let mut back = vec![0u8; 1024];
        dev.read_sectors(2, &mut back).unwrap();
        assert_eq!(back, data);
        // Neighbouring sectors untouched.
        let mut before = vec![0u8; 512];
        dev.read_sectors(1, &mut before).unwrap();
        assert_eq!(before, vec![0u8; 512]);
    }

    #[test]
    fn zero_sector_size_rejected() {
        let mut dev = MemDevice::new(0, 4);
        let mut buf = [0u8; 16];
        assert!(dev.read_sectors(0, &mut buf).is_err());
        assert!(dev.write_sectors(0, &buf).is_err());

        let path = std::env::temp_dir().join("luksblk-zero-sector-test");
        let file = File::create(&path).unwrap();
        assert!(FileDevice::new(file, 0).is_err());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn out_of_range_and_ragged_access_rejected() {
        let mut dev = MemDevice::new(512, 4);
        let mut buf = vec![0u8; 512];
        assert!(dev.read_sectors(4, &mut buf).is_err());
        assert!(dev.write_sectors(3, &vec![0u8; 1024]).is_err());
        let mut ragged = vec![0u8; 100];
        assert!(dev.read_sectors(0, &mut ragged).is_err());
    }
}
