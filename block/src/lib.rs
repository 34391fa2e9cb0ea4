//! # Block Layer
//!
//! Block device abstraction for the Onyx OS storage stack.
//!
//! ## Design
//!
//! The block layer publishes the contract every sector device driver
//! implements and that the filesystem drivers above consume:
//!
//! - Abstract [`BlockDevice`] trait (initialize, status, sector read/write)
//! - Device status bits (not initialized, no medium, write protected)
//! - Control operations (cache sync, sector-size discovery, sector erase)
//! - A RAM-backed device for tests and early bring-up
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │           Filesystem drivers            │
//! ├─────────────────────────────────────────┤
//! │              Block Layer                │
//! │  - BlockDevice trait                    │
//! │  - Status / control operations          │
//! ├─────────────────────────────────────────┤
//! │         Block Device Drivers            │
//! │  - RamDisk                              │
//! │  - (SATA / NVMe / SD live out of tree)  │
//! └─────────────────────────────────────────┘
//! ```

#![no_std]

extern crate alloc;

pub mod ramdisk;

pub use ramdisk::RamDisk;

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;
use spin::Mutex;

/// Default sector size (512 bytes)
pub const SECTOR_SIZE: usize = 512;

/// Block device errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockError {
    /// I/O error
    IoError,
    /// Write protected medium
    WriteProtected,
    /// Device not ready
    NotReady,
    /// Invalid sector number or buffer size
    InvalidParameter,
    /// Unsupported control operation
    Unsupported,
    /// Device timeout
    Timeout,
}

bitflags! {
    /// Device status bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceStatus: u8 {
        /// Drive not initialized
        const NOINIT = 0x01;
        /// No medium in the drive
        const NODISK = 0x02;
        /// Medium is write protected
        const PROTECT = 0x04;
    }
}

/// Block device trait - all sector devices implement this.
///
/// `read` and `write` transfer whole sectors; `buffer` must hold exactly
/// `count * sector_size()` bytes. A device may suspend the calling thread
/// for the duration of the transfer.
pub trait BlockDevice: Send + Sync {
    /// Initializes the device and returns its status
    fn initialize(&self) -> DeviceStatus;

    /// Returns the current device status
    fn status(&self) -> DeviceStatus;

    /// Reads `count` sectors starting at `sector` into `buffer`
    fn read(&self, buffer: &mut [u8], sector: u64, count: usize) -> Result<(), BlockError>;

    /// Writes `count` sectors starting at `sector` from `buffer`
    fn write(&self, buffer: &[u8], sector: u64, count: usize) -> Result<(), BlockError>;

    /// Flushes any pending writes in the device cache
    fn sync(&self) -> Result<(), BlockError>;

    /// Returns the sector size in bytes
    fn sector_size(&self) -> usize;

    /// Returns the total number of sectors
    fn sector_count(&self) -> u64;

    /// Erases a contiguous sector range (optional)
    fn erase(&self, first: u64, last: u64) -> Result<(), BlockError> {
        let _ = (first, last);
        Err(BlockError::Unsupported)
    }
}

/// Global block device registry
static BLOCK_DEVICES: Mutex<BTreeMap<String, Arc<dyn BlockDevice>>> =
    Mutex::new(BTreeMap::new());

/// Registers a block device under a name.
pub fn register_device(name: &str, device: Arc<dyn BlockDevice>) -> Result<(), BlockError> {
    let mut devices = BLOCK_DEVICES.lock();
    if devices.contains_key(name) {
        return Err(BlockError::InvalidParameter);
    }
    log::debug!(
        "block: registered {} ({} sectors, {} bytes/sector)",
        name,
        device.sector_count(),
        device.sector_size()
    );
    devices.insert(String::from(name), device);
    Ok(())
}

/// Unregisters a block device.
pub fn unregister_device(name: &str) -> Result<(), BlockError> {
    BLOCK_DEVICES
        .lock()
        .remove(name)
        .map(|_| ())
        .ok_or(BlockError::NotReady)
}

/// Looks a device up by name.
pub fn get_device(name: &str) -> Option<Arc<dyn BlockDevice>> {
    BLOCK_DEVICES.lock().get(name).cloned()
}

/// Names of all registered devices.
pub fn list_devices() -> Vec<String> {
    BLOCK_DEVICES.lock().keys().cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_bits() {
        let st = DeviceStatus::NOINIT | DeviceStatus::PROTECT;
        assert!(st.contains(DeviceStatus::NOINIT));
        assert!(st.contains(DeviceStatus::PROTECT));
        assert!(!st.contains(DeviceStatus::NODISK));
    }

    #[test]
    fn test_device_registry() {
        let disk = Arc::new(RamDisk::new(512, 4));
        register_device("rd-test", disk).unwrap();
        assert!(get_device("rd-test").is_some());
        assert!(list_devices().iter().any(|n| n == "rd-test"));
        unregister_device("rd-test").unwrap();
        assert!(get_device("rd-test").is_none());
    }
}
