//! # RAM Disk
//!
//! A memory-backed block device. Used by the storage stack tests and as a
//! staging device before real drivers come up.

use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

use crate::{BlockDevice, BlockError, DeviceStatus};

/// A fixed-geometry block device backed by a `Vec<u8>`.
pub struct RamDisk {
    data: Mutex<Vec<u8>>,
    sector_size: usize,
    sector_count: u64,
    read_only: bool,
}

impl RamDisk {
    /// Creates a zero-filled RAM disk with the given geometry.
    pub fn new(sector_size: usize, sector_count: u64) -> Self {
        Self {
            data: Mutex::new(vec![0u8; sector_size * sector_count as usize]),
            sector_size,
            sector_count,
            read_only: false,
        }
    }

    /// Creates a RAM disk over an existing image.
    ///
    /// The image length must be a whole number of sectors.
    pub fn from_image(sector_size: usize, image: Vec<u8>) -> Self {
        debug_assert_eq!(image.len() % sector_size, 0);
        let sector_count = (image.len() / sector_size) as u64;
        Self {
            data: Mutex::new(image),
            sector_size,
            sector_count,
            read_only: false,
        }
    }

    /// Marks the device write protected.
    pub fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    /// Runs `f` over the raw image bytes.
    pub fn with_image<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.data.lock())
    }

    /// Patches the raw image bytes. Test and tooling hook.
    pub fn patch(&self, offset: usize, bytes: &[u8]) {
        self.data.lock()[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    fn check_range(&self, sector: u64, count: usize, buf_len: usize) -> Result<(), BlockError> {
        if buf_len != count * self.sector_size {
            return Err(BlockError::InvalidParameter);
        }
        if sector + count as u64 > self.sector_count {
            return Err(BlockError::InvalidParameter);
        }
        Ok(())
    }
}

impl BlockDevice for RamDisk {
    fn initialize(&self) -> DeviceStatus {
        self.status()
    }

    fn status(&self) -> DeviceStatus {
        if self.read_only {
            DeviceStatus::PROTECT
        } else {
            DeviceStatus::empty()
        }
    }

    fn read(&self, buffer: &mut [u8], sector: u64, count: usize) -> Result<(), BlockError> {
        self.check_range(sector, count, buffer.len())?;
        let off = sector as usize * self.sector_size;
        buffer.copy_from_slice(&self.data.lock()[off..off + buffer.len()]);
        Ok(())
    }

    fn write(&self, buffer: &[u8], sector: u64, count: usize) -> Result<(), BlockError> {
        if self.read_only {
            return Err(BlockError::WriteProtected);
        }
        self.check_range(sector, count, buffer.len())?;
        let off = sector as usize * self.sector_size;
        self.data.lock()[off..off + buffer.len()].copy_from_slice(buffer);
        Ok(())
    }

    fn sync(&self) -> Result<(), BlockError> {
        Ok(())
    }

    fn sector_size(&self) -> usize {
        self.sector_size
    }

    fn sector_count(&self) -> u64 {
        self.sector_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write_roundtrip() {
        let disk = RamDisk::new(512, 16);
        let wbuf = [0xA5u8; 1024];
        disk.write(&wbuf, 3, 2).unwrap();

        let mut rbuf = [0u8; 1024];
        disk.read(&mut rbuf, 3, 2).unwrap();
        assert_eq!(&rbuf[..], &wbuf[..]);

        // Neighbouring sectors stay zero
        let mut one = [0u8; 512];
        disk.read(&mut one, 2, 1).unwrap();
        assert!(one.iter().all(|&b| b == 0));
        disk.read(&mut one, 5, 1).unwrap();
        assert!(one.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_out_of_range() {
        let disk = RamDisk::new(512, 4);
        let mut buf = [0u8; 512];
        assert_eq!(
            disk.read(&mut buf, 4, 1),
            Err(BlockError::InvalidParameter)
        );
        assert_eq!(
            disk.read(&mut buf[..256], 0, 1),
            Err(BlockError::InvalidParameter)
        );
    }

    #[test]
    fn test_write_protect() {
        let mut disk = RamDisk::new(512, 4);
        disk.set_read_only(true);
        let buf = [0u8; 512];
        assert_eq!(disk.write(&buf, 0, 1), Err(BlockError::WriteProtected));
        assert!(disk.status().contains(DeviceStatus::PROTECT));
    }
}
