//! # Volume State and Mount Probe
//!
//! Per-mount state of a FAT volume: geometry derived from the BPB, the
//! cluster allocation hints, the FSINFO dirty flag, and the single
//! sector-sized window buffer through which all metadata access goes.
//!
//! The probe accepts superfloppy media (the boot sector is sector 0) and
//! MBR-partitioned media (the first partition that probes as FAT wins).

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};
use log::debug;

use onyx_block::{BlockDevice, DeviceStatus};

use crate::codepage::{CodePage, CP437};
use crate::dir::Dir;
use crate::offsets::*;
use crate::time::no_rtc;
use crate::{ld_dword, ld_word, st_dword, st_word, FatError, SZ_DIR};

/// FAT sub-type of a mounted volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatType {
    Fat12,
    Fat16,
    Fat32,
}

/// Minimum number of clusters for FAT16.
pub const MIN_FAT16: u32 = 4086;
/// Minimum number of clusters for FAT32.
pub const MIN_FAT32: u32 = 65526;

/// Sentinel for "window holds no sector".
const SECT_NONE: u64 = u64::MAX;

/// Monotonic mount identifier, stamped into every volume and handle.
static FSID: AtomicU32 = AtomicU32::new(0);

/// Mount-time configuration.
pub struct MountOptions {
    /// Mount read-only.
    pub readonly: bool,
    /// OEM code page for short names.
    pub codepage: &'static CodePage,
    /// Clock supplying DOS-packed timestamps.
    pub clock: fn() -> u32,
}

impl Default for MountOptions {
    fn default() -> Self {
        MountOptions {
            readonly: false,
            codepage: &CP437,
            clock: no_rtc,
        }
    }
}

/// A mounted FAT volume.
///
/// All driver operations on the volume require `&mut self`; the owner
/// wraps the volume in the per-volume mutex, which makes the driver
/// single-threaded per volume by construction.
pub struct Volume {
    pub(crate) dev: Arc<dyn BlockDevice>,
    pub(crate) fs_type: FatType,
    pub(crate) readonly: bool,
    /// Sector size in bytes
    pub(crate) ssize: usize,
    /// Cluster size in sectors (power of two)
    pub(crate) csize: u32,
    /// Number of FAT copies (1 or 2)
    pub(crate) n_fats: u8,
    /// Number of root directory entries (FAT12/16, 0 on FAT32)
    pub(crate) n_rootdir: u32,
    /// Sectors per FAT
    pub(crate) fsize: u32,
    /// Number of FAT entries (clusters + 2)
    pub(crate) n_fatent: u32,
    /// Volume base sector
    pub(crate) volbase: u64,
    /// FAT area base sector
    pub(crate) fatbase: u64,
    /// Root directory base: cluster# on FAT32, sector# on FAT12/16
    pub(crate) dirbase: u64,
    /// Data area base sector
    pub(crate) database: u64,
    /// Last allocated cluster hint (advisory)
    pub(crate) last_clust: u32,
    /// Free cluster count hint (advisory, 0xFFFFFFFF = unknown)
    pub(crate) free_clust: u32,
    /// FSINFO state: 0x80 disabled, 1 dirty, 0 clean
    pub(crate) fsi_flag: u8,
    /// Sector window buffer
    pub(crate) win: Vec<u8>,
    /// Sector currently held in the window
    pub(crate) winsect: u64,
    /// Window dirty flag
    pub(crate) wflag: bool,
    /// Mount identifier for stale-handle detection
    pub(crate) id: u32,
    pub(crate) codepage: &'static CodePage,
    pub(crate) clock: fn() -> u32,
}

impl core::fmt::Debug for Volume {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Volume")
            .field("fs_type", &self.fs_type)
            .field("readonly", &self.readonly)
            .field("ssize", &self.ssize)
            .field("csize", &self.csize)
            .field("n_fats", &self.n_fats)
            .field("n_rootdir", &self.n_rootdir)
            .field("fsize", &self.fsize)
            .field("n_fatent", &self.n_fatent)
            .field("volbase", &self.volbase)
            .field("fatbase", &self.fatbase)
            .field("dirbase", &self.dirbase)
            .field("database", &self.database)
            .field("last_clust", &self.last_clust)
            .field("free_clust", &self.free_clust)
            .field("fsi_flag", &self.fsi_flag)
            .field("winsect", &self.winsect)
            .field("wflag", &self.wflag)
            .field("id", &self.id)
            .field("codepage", &self.codepage)
            .finish()
    }
}

impl Volume {
    /// Probes `dev` for a FAT volume and mounts it.
    pub fn mount(dev: Arc<dyn BlockDevice>, opts: MountOptions) -> Result<Volume, FatError> {
        let stat = dev.initialize();
        if stat.intersects(DeviceStatus::NOINIT | DeviceStatus::NODISK) {
            return Err(FatError::NotReady);
        }
        if stat.contains(DeviceStatus::PROTECT) && !opts.readonly {
            return Err(FatError::WriteProtected);
        }

        let ssize = dev.sector_size();
        if !(512..=4096).contains(&ssize) || !ssize.is_power_of_two() {
            return Err(FatError::DiskErr);
        }

        let mut vol = Volume {
            dev,
            fs_type: FatType::Fat12,
            readonly: opts.readonly,
            ssize,
            csize: 0,
            n_fats: 0,
            n_rootdir: 0,
            fsize: 0,
            n_fatent: 0,
            volbase: 0,
            fatbase: 0,
            dirbase: 0,
            database: 0,
            last_clust: 0xFFFF_FFFF,
            free_clust: 0xFFFF_FFFF,
            fsi_flag: 0x80,
            win: vec![0u8; ssize],
            winsect: SECT_NONE,
            wflag: false,
            id: 0,
            codepage: opts.codepage,
            clock: opts.clock,
        };

        vol.find_volume()?;
        vol.id = FSID.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
        crate::lock::clear_lock(vol.id);

        debug!(
            "fatfs: mounted {:?} volume, {} clusters of {} sectors",
            vol.fs_type,
            vol.n_fatent - 2,
            vol.csize
        );
        Ok(vol)
    }

    /// Checks whether `sect` holds a FAT boot sector.
    /// 0: FAT boot sector, 1: valid boot sector but not FAT,
    /// 2: not a boot sector, 3: disk error.
    fn check_fs(&mut self, sect: u64) -> u8 {
        self.wflag = false;
        self.winsect = SECT_NONE;
        if self.move_window(sect).is_err() {
            return 3;
        }

        // The signature word sits at offset 510 even for larger sectors.
        if ld_word(&self.win[BS_55AA..]) != 0xAA55 {
            return 2;
        }

        if ld_dword(&self.win[BS_FIL_SYS_TYPE..]) & 0xFF_FFFF == 0x54_4146 {
            return 0; /* "FAT" */
        }
        if ld_dword(&self.win[BS_FIL_SYS_TYPE32..]) & 0xFF_FFFF == 0x54_4146 {
            return 0; /* "FAT" in a FAT32 BPB */
        }

        1
    }

    /// Locates the FAT boot sector and initialises the volume geometry
    /// from the BPB.
    fn find_volume(&mut self) -> Result<(), FatError> {
        let mut bsect = 0u64;
        let mut fmt = self.check_fs(bsect);
        if fmt == 1 {
            // Valid boot sector but not FAT: walk the MBR partitions.
            let mut br = [0u64; 4];
            for (i, part) in br.iter_mut().enumerate() {
                let pt = MBR_TABLE + i * SZ_PTE;
                *part = if self.win[pt + 4] != 0 {
                    ld_dword(&self.win[pt + 8..]) as u64
                } else {
                    0
                };
            }
            let mut i = 0;
            loop {
                bsect = br[i];
                fmt = if bsect != 0 { self.check_fs(bsect) } else { 2 };
                i += 1;
                if fmt == 0 || i >= 4 {
                    break;
                }
            }
        }
        if fmt == 3 {
            return Err(FatError::DiskErr);
        }
        if fmt != 0 {
            return Err(FatError::NoFilesystem);
        }

        if ld_word(&self.win[BPB_BYTS_PER_SEC..]) as usize != self.ssize {
            return Err(FatError::NoFilesystem);
        }

        let mut fasize = ld_word(&self.win[BPB_FAT_SZ16..]) as u32;
        if fasize == 0 {
            fasize = ld_dword(&self.win[BPB_FAT_SZ32..]);
        }
        self.fsize = fasize;

        self.n_fats = self.win[BPB_NUM_FATS];
        if self.n_fats != 1 && self.n_fats != 2 {
            return Err(FatError::NoFilesystem);
        }
        let fasize = fasize * self.n_fats as u32;

        self.csize = self.win[BPB_SEC_PER_CLUS] as u32;
        if self.csize == 0 || !self.csize.is_power_of_two() {
            return Err(FatError::NoFilesystem);
        }

        self.n_rootdir = ld_word(&self.win[BPB_ROOT_ENT_CNT..]) as u32;
        if self.n_rootdir % (self.ssize / SZ_DIR) as u32 != 0 {
            return Err(FatError::NoFilesystem);
        }

        let mut tsect = ld_word(&self.win[BPB_TOT_SEC16..]) as u32;
        if tsect == 0 {
            tsect = ld_dword(&self.win[BPB_TOT_SEC32..]);
        }

        let nrsv = ld_word(&self.win[BPB_RSVD_SEC_CNT..]) as u32;
        if nrsv == 0 {
            return Err(FatError::NoFilesystem);
        }

        // Determine the FAT sub type from the cluster count.
        let sysect = nrsv + fasize + self.n_rootdir / (self.ssize / SZ_DIR) as u32;
        if tsect < sysect {
            return Err(FatError::NoFilesystem);
        }
        let nclst = (tsect - sysect) / self.csize;
        if nclst == 0 {
            return Err(FatError::NoFilesystem);
        }
        let fmt = if nclst >= MIN_FAT32 {
            FatType::Fat32
        } else if nclst >= MIN_FAT16 {
            FatType::Fat16
        } else {
            FatType::Fat12
        };

        self.n_fatent = nclst + 2;
        self.volbase = bsect;
        self.fatbase = bsect + nrsv as u64;
        self.database = bsect + sysect as u64;
        let szbfat = match fmt {
            FatType::Fat32 => {
                if self.n_rootdir != 0 {
                    return Err(FatError::NoFilesystem);
                }
                self.dirbase = ld_dword(&self.win[BPB_ROOT_CLUS..]) as u64;
                self.n_fatent * 4
            }
            FatType::Fat16 => {
                if self.n_rootdir == 0 {
                    return Err(FatError::NoFilesystem);
                }
                self.dirbase = self.fatbase + fasize as u64;
                self.n_fatent * 2
            }
            FatType::Fat12 => {
                if self.n_rootdir == 0 {
                    return Err(FatError::NoFilesystem);
                }
                self.dirbase = self.fatbase + fasize as u64;
                self.n_fatent * 3 / 2 + (self.n_fatent & 1)
            }
        };
        if self.fsize < (szbfat + (self.ssize as u32 - 1)) / self.ssize as u32 {
            return Err(FatError::NoFilesystem);
        }

        if !self.readonly {
            // Initialize cluster allocation information.
            self.last_clust = 0xFFFF_FFFF;
            self.free_clust = 0xFFFF_FFFF;
            self.fsi_flag = 0x80;
            if fmt == FatType::Fat32
                && ld_word(&self.win[BPB_FS_INFO..]) == 1
                && self.move_window(bsect + 1).is_ok()
            {
                self.fsi_flag = 0;
                if ld_word(&self.win[BS_55AA..]) == 0xAA55
                    && ld_dword(&self.win[FSI_LEAD_SIG..]) == 0x4161_5252
                    && ld_dword(&self.win[FSI_STRUC_SIG..]) == 0x6141_7272
                {
                    self.free_clust = ld_dword(&self.win[FSI_FREE_COUNT..]);
                    self.last_clust = ld_dword(&self.win[FSI_NXT_FREE..]);
                }
            }
        }

        self.fs_type = fmt;
        Ok(())
    }

    /// Writes the window back if dirty, mirroring FAT-area sectors into
    /// every FAT copy.
    pub(crate) fn sync_window(&mut self) -> Result<(), FatError> {
        if self.wflag {
            let mut wsect = self.winsect;
            self.dev
                .write(&self.win, wsect, 1)
                .map_err(|_| FatError::DiskErr)?;
            self.wflag = false;
            if wsect >= self.fatbase && wsect < self.fatbase + self.fsize as u64 {
                let mut nf = self.n_fats;
                while nf >= 2 {
                    wsect += self.fsize as u64;
                    let _ = self.dev.write(&self.win, wsect, 1);
                    nf -= 1;
                }
            }
        }
        Ok(())
    }

    /// Makes `sector` current in the window, flushing first if dirty.
    pub(crate) fn move_window(&mut self, sector: u64) -> Result<(), FatError> {
        if sector != self.winsect {
            if !self.readonly {
                self.sync_window()?;
            }
            if self.dev.read(&mut self.win, sector, 1).is_err() {
                self.winsect = SECT_NONE;
                return Err(FatError::DiskErr);
            }
            self.winsect = sector;
        }
        Ok(())
    }

    /// Flushes the window, rewrites FSINFO when dirty, and fences with a
    /// device cache sync.
    pub(crate) fn sync_fs(&mut self) -> Result<(), FatError> {
        self.sync_window()?;

        if self.fs_type == FatType::Fat32 && self.fsi_flag == 1 {
            self.win.fill(0);
            st_word(&mut self.win[BS_55AA..], 0xAA55);
            st_dword(&mut self.win[FSI_LEAD_SIG..], 0x4161_5252);
            st_dword(&mut self.win[FSI_STRUC_SIG..], 0x6141_7272);
            st_dword(&mut self.win[FSI_FREE_COUNT..], self.free_clust);
            st_dword(&mut self.win[FSI_NXT_FREE..], self.last_clust);
            self.winsect = self.volbase + 1;
            self.dev
                .write(&self.win, self.winsect, 1)
                .map_err(|_| FatError::DiskErr)?;
            self.fsi_flag = 0;
        }

        self.dev.sync().map_err(|_| FatError::DiskErr)?;
        Ok(())
    }

    /// Converts a cluster number into its first sector.
    /// Returns 0 for an invalid cluster number.
    pub(crate) fn clust2sect(&self, clst: u32) -> u64 {
        let clst = clst.wrapping_sub(2);
        if clst >= self.n_fatent - 2 {
            return 0;
        }
        clst as u64 * self.csize as u64 + self.database
    }

    /// FAT sub-type of the volume.
    pub fn fs_type(&self) -> FatType {
        self.fs_type
    }

    /// Mount identifier.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// True if the volume is mounted read-only.
    pub fn readonly(&self) -> bool {
        self.readonly
    }

    /// Returns the number of free clusters, scanning the FAT when the
    /// FSINFO hint is not valid. A completed scan refreshes the hint.
    pub fn getfree(&mut self) -> Result<u32, FatError> {
        if self.free_clust <= self.n_fatent - 2 {
            return Ok(self.free_clust);
        }

        let mut n = 0u32;
        match self.fs_type {
            FatType::Fat12 => {
                for clst in 2..self.n_fatent {
                    match self.get_fat(clst) {
                        0xFFFF_FFFF => return Err(FatError::DiskErr),
                        1 => return Err(FatError::IntErr),
                        0 => n += 1,
                        _ => {}
                    }
                }
            }
            FatType::Fat16 | FatType::Fat32 => {
                let esize = if self.fs_type == FatType::Fat16 { 2 } else { 4 };
                let mut clst = self.n_fatent;
                let mut sect = self.fatbase;
                let mut i = 0usize;
                while clst > 0 {
                    if i == 0 {
                        self.move_window(sect)?;
                        sect += 1;
                        i = self.ssize;
                    }
                    let off = self.ssize - i;
                    let free = if esize == 2 {
                        ld_word(&self.win[off..]) == 0
                    } else {
                        ld_dword(&self.win[off..]) & 0x0FFF_FFFF == 0
                    };
                    if free {
                        n += 1;
                    }
                    i -= esize;
                    clst -= 1;
                }
                // The first two FAT entries are reserved, never free.
            }
        }

        self.free_clust = n;
        self.fsi_flag |= 1;
        Ok(n)
    }

    /// Reads the volume label and serial number.
    ///
    /// The label comes from the volume-label entry in the root directory,
    /// the serial number from the BPB.
    pub fn getlabel(&mut self) -> Result<(String, u32), FatError> {
        let mut label = String::new();
        let mut dj = Dir::new(0);
        dj.sdi(self, 0)?;
        match dj.read(self, true) {
            Ok(()) => {
                let off = dj.win_off;
                let raw: [u8; 11] = self.win[off..off + 11].try_into().unwrap();
                let mut end = 11;
                while end > 0 && raw[end - 1] == b' ' {
                    end -= 1;
                }
                for &c in &raw[..end] {
                    label.push(self.codepage.oem_to_unicode(c).unwrap_or('?'));
                }
            }
            Err(FatError::NoFile) => {}
            Err(e) => return Err(e),
        }

        self.move_window(self.volbase)?;
        let vsn_off = if self.fs_type == FatType::Fat32 {
            BS_VOL_ID32
        } else {
            BS_VOL_ID
        };
        let vsn = ld_dword(&self.win[vsn_off..]);

        Ok((label, vsn))
    }
}
