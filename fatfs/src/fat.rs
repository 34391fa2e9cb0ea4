//! # FAT Table Access
//!
//! Reading and writing FAT entries and the cluster-chain operations built
//! on them. FAT12 entries are packed in one-and-a-half bytes: even
//! clusters take the low 12 bits of the little-endian pair, odd clusters
//! the high 12 bits, and an entry may straddle a sector boundary.

use crate::volume::{FatType, Volume};
use crate::{ld_dword, ld_word, st_dword, st_word, FatError};

impl Volume {
    /// Reads the FAT entry of cluster `clst`.
    ///
    /// Sentinel returns: `0` free cell, `1` internal error (malformed or
    /// out-of-range), `0xFFFFFFFF` disk error; anything else is the next
    /// cluster number or an end-of-chain mark (`>= n_fatent`).
    pub(crate) fn get_fat(&mut self, clst: u32) -> u32 {
        if clst < 2 || clst >= self.n_fatent {
            return 1;
        }

        let ss = self.ssize;
        match self.fs_type {
            FatType::Fat12 => {
                let mut bc = clst as usize + clst as usize / 2;
                if self
                    .move_window(self.fatbase + (bc / ss) as u64)
                    .is_err()
                {
                    return 0xFFFF_FFFF;
                }
                let mut wc = self.win[bc % ss] as u32;
                bc += 1;
                if self
                    .move_window(self.fatbase + (bc / ss) as u64)
                    .is_err()
                {
                    return 0xFFFF_FFFF;
                }
                wc |= (self.win[bc % ss] as u32) << 8;
                if clst & 1 != 0 {
                    wc >> 4
                } else {
                    wc & 0xFFF
                }
            }
            FatType::Fat16 => {
                if self
                    .move_window(self.fatbase + (clst as usize / (ss / 2)) as u64)
                    .is_err()
                {
                    return 0xFFFF_FFFF;
                }
                ld_word(&self.win[clst as usize * 2 % ss..]) as u32
            }
            FatType::Fat32 => {
                if self
                    .move_window(self.fatbase + (clst as usize / (ss / 4)) as u64)
                    .is_err()
                {
                    return 0xFFFF_FFFF;
                }
                ld_dword(&self.win[clst as usize * 4 % ss..]) & 0x0FFF_FFFF
            }
        }
    }

    /// Writes `val` into the FAT entry of cluster `clst`, mirroring into
    /// all FAT copies at the next window flush. FAT32 preserves the four
    /// reserved top bits on disk.
    pub(crate) fn put_fat(&mut self, clst: u32, val: u32) -> Result<(), FatError> {
        if clst < 2 || clst >= self.n_fatent {
            return Err(FatError::IntErr);
        }

        let ss = self.ssize;
        match self.fs_type {
            FatType::Fat12 => {
                let mut bc = clst as usize + clst as usize / 2;
                self.move_window(self.fatbase + (bc / ss) as u64)?;
                let p = &mut self.win[bc % ss];
                *p = if clst & 1 != 0 {
                    (*p & 0x0F) | ((val as u8) << 4)
                } else {
                    val as u8
                };
                bc += 1;
                self.wflag = true;
                self.move_window(self.fatbase + (bc / ss) as u64)?;
                let p = &mut self.win[bc % ss];
                *p = if clst & 1 != 0 {
                    (val >> 4) as u8
                } else {
                    (*p & 0xF0) | ((val >> 8) as u8 & 0x0F)
                };
            }
            FatType::Fat16 => {
                self.move_window(self.fatbase + (clst as usize / (ss / 2)) as u64)?;
                st_word(&mut self.win[clst as usize * 2 % ss..], val as u16);
            }
            FatType::Fat32 => {
                self.move_window(self.fatbase + (clst as usize / (ss / 4)) as u64)?;
                let off = clst as usize * 4 % ss;
                let val = val | (ld_dword(&self.win[off..]) & 0xF000_0000);
                st_dword(&mut self.win[off..], val);
            }
        }
        self.wflag = true;

        Ok(())
    }

    /// Removes the cluster chain starting at `clst`, marking every cluster
    /// free and crediting the free-count hint. Stops cleanly at a free
    /// cell or end-of-chain mark.
    pub(crate) fn remove_chain(&mut self, clst: u32) -> Result<(), FatError> {
        if clst < 2 || clst >= self.n_fatent {
            return Err(FatError::IntErr);
        }

        let mut clst = clst;
        while clst < self.n_fatent {
            let nxt = self.get_fat(clst);
            if nxt == 0 {
                break;
            }
            if nxt == 1 {
                return Err(FatError::IntErr);
            }
            if nxt == 0xFFFF_FFFF {
                return Err(FatError::DiskErr);
            }
            self.put_fat(clst, 0)?;
            if self.free_clust != 0xFFFF_FFFF {
                self.free_clust += 1;
                self.fsi_flag |= 1;
            }
            clst = nxt;
        }

        Ok(())
    }

    /// Stretches the chain at `clst`, or creates a new chain when `clst`
    /// is 0. Scans for a free cluster from the allocation hint, wrapping
    /// once.
    ///
    /// Sentinel returns: `0` no free cluster, `1` internal error,
    /// `0xFFFFFFFF` disk error; otherwise the newly linked cluster.
    ///
    /// The wrap probe exits on `ncl == scl`, so on a volume whose only
    /// free cluster is the scan start itself this reports "no free
    /// cluster".
    pub(crate) fn create_chain(&mut self, clst: u32) -> u32 {
        let scl;
        if clst == 0 {
            scl = match self.last_clust {
                0 | 0xFFFF_FFFF => 1,
                c if c >= self.n_fatent => 1,
                c => c,
            };
        } else {
            let cs = self.get_fat(clst);
            if cs < 2 {
                return 1;
            }
            if cs == 0xFFFF_FFFF {
                return cs;
            }
            if cs < self.n_fatent {
                return cs; /* already followed by a next cluster */
            }
            scl = clst;
        }

        let mut ncl = scl;
        loop {
            ncl += 1;
            if ncl >= self.n_fatent {
                ncl = 2;
                if ncl > scl {
                    return 0; /* no free cluster */
                }
            }
            let cs = self.get_fat(ncl);
            if cs == 0 {
                break;
            }
            if cs == 0xFFFF_FFFF || cs == 1 {
                return cs;
            }
            if ncl == scl {
                return 0; /* wrapped around without a free cluster */
            }
        }

        let mut res = self.put_fat(ncl, 0x0FFF_FFFF);
        if res.is_ok() && clst != 0 {
            res = self.put_fat(clst, ncl);
        }
        if let Err(e) = res {
            return if e == FatError::DiskErr { 0xFFFF_FFFF } else { 1 };
        }
        self.last_clust = ncl;
        if self.free_clust != 0xFFFF_FFFF {
            self.free_clust -= 1;
            self.fsi_flag |= 1;
        }

        ncl
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{mkfat, mount_img, FatKind};

    #[test]
    fn test_get_fat_range_check() {
        let mut vol = mount_img(mkfat(FatKind::Fat12, 128));
        assert_eq!(vol.get_fat(0), 1);
        assert_eq!(vol.get_fat(1), 1);
        assert_eq!(vol.get_fat(vol.n_fatent), 1);
        // Cluster 2 of a fresh volume is free.
        assert_eq!(vol.get_fat(2), 0);
    }

    #[test]
    fn test_fat12_odd_even_packing() {
        let mut vol = mount_img(mkfat(FatKind::Fat12, 128));
        vol.put_fat(2, 0xABC).unwrap();
        vol.put_fat(3, 0x123).unwrap();
        vol.put_fat(4, 0xFFF).unwrap();
        assert_eq!(vol.get_fat(2), 0xABC);
        assert_eq!(vol.get_fat(3), 0x123);
        assert_eq!(vol.get_fat(4), 0xFFF);
        // Neighbours were not disturbed by the shared middle byte.
        vol.put_fat(3, 0).unwrap();
        assert_eq!(vol.get_fat(2), 0xABC);
        assert_eq!(vol.get_fat(4), 0xFFF);
    }

    #[test]
    fn test_fat12_entry_across_sector_boundary() {
        // FAT12 entry 341 begins at FAT byte 511 and spans two sectors.
        let mut vol = mount_img(mkfat(FatKind::Fat12, 700));
        vol.put_fat(340, 0x345).unwrap();
        vol.put_fat(341, 0x89A).unwrap();
        vol.put_fat(342, 0x67B).unwrap();
        assert_eq!(vol.get_fat(340), 0x345);
        assert_eq!(vol.get_fat(341), 0x89A);
        assert_eq!(vol.get_fat(342), 0x67B);
    }

    #[test]
    fn test_fat_mirror_consistency() {
        // Window flushes must reflect FAT sectors into every copy.
        let disk = mkfat(FatKind::Fat12, 700);
        let mut vol = mount_img(disk.clone());
        vol.put_fat(2, 0xFFF).unwrap();
        vol.put_fat(341, 0x89A).unwrap();
        vol.sync_fs().unwrap();

        let fat_off = vol.fatbase as usize * vol.ssize;
        let fsz = vol.fsize as usize * vol.ssize;
        disk.with_image(|img| {
            assert_eq!(
                &img[fat_off..fat_off + fsz],
                &img[fat_off + fsz..fat_off + 2 * fsz]
            );
        });
    }

    #[test]
    fn test_fat32_preserves_reserved_bits() {
        let mut vol = mount_img(mkfat(FatKind::Fat32, crate::volume::MIN_FAT32));
        // Plant reserved bits, then overwrite the entry.
        vol.put_fat(5, 0x0FFF_FFFF).unwrap();
        let off = 5usize * 4 % vol.ssize;
        let sect = vol.fatbase + (5 * 4 / vol.ssize) as u64;
        vol.move_window(sect).unwrap();
        vol.win[off + 3] |= 0xA0;
        vol.put_fat(5, 7).unwrap();
        vol.move_window(sect).unwrap();
        assert_eq!(crate::ld_dword(&vol.win[off..]) >> 28, 0x0A);
        assert_eq!(vol.get_fat(5), 7);
    }

    #[test]
    fn test_chain_create_and_remove() {
        let mut vol = mount_img(mkfat(FatKind::Fat16, 4100));
        let free0 = vol.getfree().unwrap();

        // Build a three cluster chain.
        let c1 = vol.create_chain(0);
        assert!(c1 >= 2);
        let c2 = vol.create_chain(c1);
        let c3 = vol.create_chain(c2);
        assert!(c2 >= 2 && c3 >= 2);
        assert_eq!(vol.get_fat(c1), c2);
        assert_eq!(vol.get_fat(c2), c3);
        assert!(vol.get_fat(c3) >= vol.n_fatent);
        assert_eq!(vol.getfree().unwrap(), free0 - 3);

        // Stretching a mid-chain cluster just follows the chain.
        assert_eq!(vol.create_chain(c1), c2);

        // Removing restores the free count.
        vol.remove_chain(c1).unwrap();
        assert_eq!(vol.getfree().unwrap(), free0);
        assert_eq!(vol.get_fat(c1), 0);
        assert_eq!(vol.get_fat(c2), 0);
        assert_eq!(vol.get_fat(c3), 0);
    }

    #[test]
    fn test_allocator_exhaustion() {
        let mut vol = mount_img(mkfat(FatKind::Fat12, 8));
        let mut last = 0;
        let mut n = 0;
        loop {
            let c = vol.create_chain(last);
            if c == 0 {
                break;
            }
            assert!(c >= 2, "allocator returned error {}", c);
            last = c;
            n += 1;
            assert!(n <= 8, "allocated more clusters than the volume has");
        }
        // All clusters allocated; a fresh chain cannot start either.
        assert_eq!(vol.create_chain(0), 0);
    }
}
