//! # Directory Handling
//!
//! Directory table iteration over both flavours of FAT directories: the
//! static FAT12/16 root (a fixed run of sectors) and cluster-chain backed
//! tables. On top of the iterator sit find/read/register/remove and the
//! directory-level volume operations (create, unlink, mkdir, rename).

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use crate::lock;
use crate::name::{
    cmp_lfn, create_name, fit_lfn, gen_numname, pick_lfn, sum_sfn, NS, NS_LFN, NS_LOSS,
};
use crate::offsets::*;
use crate::volume::{FatType, Volume};
use crate::{attr, ld_dword, ld_word, st_dword, st_word, FatError, DDE, LLE, MAX_LFN, NDDE, SZ_DIR};

/// Location of a directory entry: the containing table's start cluster
/// and the entry index within it. This pair keys the open-file lock
/// table and identifies objects across handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DirPos {
    pub sclust: u32,
    pub index: u16,
}

/// Snapshot of a directory entry taken while the window held it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct EntryInfo {
    pub attr: u8,
    pub sclust: u32,
    pub size: u32,
    pub fdate: u16,
    pub ftime: u16,
    pub pos: DirPos,
}

/// Decoded name information for one directory object.
#[derive(Debug, Clone)]
pub(crate) struct FileInfo {
    pub fname: String,
    pub lfname: Option<String>,
    pub entry: EntryInfo,
}

impl FileInfo {
    /// The display name: long form when present, short otherwise.
    pub fn name(&self) -> &str {
        self.lfname.as_deref().unwrap_or(&self.fname)
    }
}

/// Directory iterator.
#[derive(Debug)]
pub(crate) struct Dir {
    /// Table start cluster (0: root directory)
    pub(crate) sclust: u32,
    /// Current cluster
    pub(crate) clust: u32,
    /// Current sector (0: iteration ended)
    pub(crate) sect: u64,
    /// Current entry index
    pub(crate) index: u16,
    /// Offset of the current entry inside the window
    pub(crate) win_off: usize,
    /// Short name in directory form plus the name status byte
    pub(crate) fname: [u8; 12],
    /// Long name working buffer
    pub(crate) lfn: Vec<u16>,
    /// Whether find/read accumulate and match long names
    pub(crate) use_lfn: bool,
    /// Index of the top LFN entry of the current object (0xFFFF: none)
    pub(crate) lfn_idx: u16,
}

impl Dir {
    pub(crate) fn new(sclust: u32) -> Dir {
        Dir {
            sclust,
            clust: 0,
            sect: 0,
            index: 0,
            win_off: 0,
            fname: [b' '; 12],
            lfn: vec![0u16; MAX_LFN + 1],
            use_lfn: true,
            lfn_idx: 0xFFFF,
        }
    }

    /// Sets the iterator to entry `idx`, following the cluster chain for
    /// dynamic tables.
    pub(crate) fn sdi(&mut self, vol: &mut Volume, idx: u32) -> Result<(), FatError> {
        self.index = idx as u16;
        let mut clst = self.sclust;
        if clst == 1 || clst >= vol.n_fatent {
            return Err(FatError::IntErr);
        }
        if clst == 0 && vol.fs_type == FatType::Fat32 {
            // Cluster 0 stands for the root directory.
            clst = vol.dirbase as u32;
        }

        let epd = (vol.ssize / SZ_DIR) as u32;
        let mut idx = idx;
        let sect;
        if clst == 0 {
            // Static root directory table.
            if idx >= vol.n_rootdir {
                return Err(FatError::IntErr);
            }
            sect = vol.dirbase;
        } else {
            let ic = epd * vol.csize;
            while idx >= ic {
                clst = vol.get_fat(clst);
                if clst == 0xFFFF_FFFF {
                    return Err(FatError::DiskErr);
                }
                if clst < 2 || clst >= vol.n_fatent {
                    return Err(FatError::IntErr);
                }
                idx -= ic;
            }
            sect = vol.clust2sect(clst);
        }

        self.clust = clst;
        if sect == 0 {
            return Err(FatError::IntErr);
        }
        self.sect = sect + (idx / epd) as u64;
        self.win_off = (idx % epd) as usize * SZ_DIR;
        Ok(())
    }

    /// Advances to the next entry. In stretch mode the table grows by a
    /// zero-filled cluster when the chain ends; otherwise the end of the
    /// table reports `NoFile`.
    pub(crate) fn next(&mut self, vol: &mut Volume, stretch: bool) -> Result<(), FatError> {
        let i = self.index as u32 + 1;
        if i & 0xFFFF == 0 || self.sect == 0 {
            // The index is bounded to 16 bits.
            return Err(FatError::NoFile);
        }

        let epd = (vol.ssize / SZ_DIR) as u32;
        if i % epd == 0 {
            self.sect += 1;

            if self.clust == 0 {
                if i >= vol.n_rootdir {
                    return Err(FatError::NoFile);
                }
            } else if (i / epd) & (vol.csize - 1) == 0 {
                // Crossed a cluster boundary.
                let mut clst = vol.get_fat(self.clust);
                if clst <= 1 {
                    return Err(FatError::IntErr);
                }
                if clst == 0xFFFF_FFFF {
                    return Err(FatError::DiskErr);
                }
                if clst >= vol.n_fatent {
                    if vol.readonly || !stretch {
                        return Err(FatError::NoFile);
                    }
                    clst = match vol.create_chain(self.clust) {
                        0 => return Err(FatError::Denied),
                        1 => return Err(FatError::IntErr),
                        0xFFFF_FFFF => return Err(FatError::DiskErr),
                        c => c,
                    };
                    // Zero-fill the stretched cluster through the window.
                    vol.sync_window()?;
                    vol.win.fill(0);
                    vol.winsect = vol.clust2sect(clst);
                    for _ in 0..vol.csize {
                        vol.wflag = true;
                        vol.sync_window()?;
                        vol.winsect += 1;
                    }
                    vol.winsect -= vol.csize as u64;
                }
                self.clust = clst;
                self.sect = vol.clust2sect(clst);
            }
        }

        self.index = i as u16;
        self.win_off = (i % epd) as usize * SZ_DIR;
        Ok(())
    }

    /// Reserves `nent` contiguous blank entries, stretching the table
    /// when allowed. Leaves the iterator at the last reserved entry.
    pub(crate) fn alloc(&mut self, vol: &mut Volume, nent: u32) -> Result<(), FatError> {
        self.sdi(vol, 0)?;
        let mut n = 0u32;
        loop {
            vol.move_window(self.sect)?;
            let c = vol.win[self.win_off];
            if c == DDE || c == 0 {
                n += 1;
                if n == nent {
                    return Ok(());
                }
            } else {
                n = 0;
            }
            match self.next(vol, true) {
                Ok(()) => {}
                Err(FatError::NoFile) => return Err(FatError::Denied),
                Err(e) => return Err(e),
            }
        }
    }

    /// Finds the object named by the short/long name buffers. On success
    /// the iterator holds the short entry and the window contains it.
    pub(crate) fn find(&mut self, vol: &mut Volume) -> Result<(), FatError> {
        self.sdi(vol, 0)?;

        let mut ord: u8 = 0xFF;
        let mut sum: u8 = 0xFF;
        self.lfn_idx = 0xFFFF;
        loop {
            vol.move_window(self.sect)?;
            let ent: [u8; SZ_DIR] = vol.win[self.win_off..self.win_off + SZ_DIR]
                .try_into()
                .unwrap();
            let c = ent[DIR_NAME];
            if c == 0 {
                return Err(FatError::NoFile);
            }
            let a = ent[DIR_ATTR] & attr::AM_MASK;
            if c == DDE || (a & attr::AM_VOL != 0 && a != attr::AM_LFN) {
                // Not an entry of interest: reset the LFN accumulator.
                ord = 0xFF;
                self.lfn_idx = 0xFFFF;
            } else if a == attr::AM_LFN {
                if self.use_lfn {
                    let mut c = c;
                    if c & LLE != 0 {
                        sum = ent[LDIR_CHKSUM];
                        c &= !LLE;
                        ord = c;
                        self.lfn_idx = self.index;
                    }
                    // Ordinals must be contiguous and the checksum stable.
                    ord = if c == ord && sum == ent[LDIR_CHKSUM] && cmp_lfn(&self.lfn, &ent) {
                        ord.wrapping_sub(1)
                    } else {
                        0xFF
                    };
                }
            } else {
                if ord == 0 && sum == sum_sfn(&ent) {
                    break; /* the accumulated LFN matched */
                }
                if self.fname[NS] & NS_LOSS == 0 && ent[..11] == self.fname[..11] {
                    break; /* exact short name match */
                }
                ord = 0xFF;
                self.lfn_idx = 0xFFFF;
            }
            self.next(vol, false)?;
        }

        Ok(())
    }

    /// Reads the next real object, optionally filtered to the volume
    /// label. On success the iterator holds its short entry.
    pub(crate) fn read(&mut self, vol: &mut Volume, vol_label: bool) -> Result<(), FatError> {
        let mut ord: u8 = 0xFF;
        let mut sum: u8 = 0xFF;
        let mut res = Err(FatError::NoFile);

        while self.sect != 0 {
            vol.move_window(self.sect)?;
            let ent: [u8; SZ_DIR] = vol.win[self.win_off..self.win_off + SZ_DIR]
                .try_into()
                .unwrap();
            let c = ent[DIR_NAME];
            if c == 0 {
                res = Err(FatError::NoFile);
                break;
            }
            let a = ent[DIR_ATTR] & attr::AM_MASK;
            if c == DDE || c == b'.' || ((a == attr::AM_VOL) != vol_label) {
                ord = 0xFF;
            } else if a == attr::AM_LFN {
                let mut c = c;
                if c & LLE != 0 {
                    sum = ent[LDIR_CHKSUM];
                    c &= !LLE;
                    ord = c;
                    self.lfn_idx = self.index;
                }
                ord = if c == ord && sum == ent[LDIR_CHKSUM] && pick_lfn(&mut self.lfn, &ent) {
                    ord.wrapping_sub(1)
                } else {
                    0xFF
                };
            } else {
                if ord != 0 || sum != sum_sfn(&ent) {
                    self.lfn_idx = 0xFFFF; /* the entry has no valid LFN */
                }
                res = Ok(());
                break;
            }

            match self.next(vol, false) {
                Ok(()) => {}
                Err(e) => {
                    res = Err(e);
                    break;
                }
            }
        }

        if res.is_err() {
            self.sect = 0;
        }
        res
    }

    /// Registers the object name as a new directory entry, generating a
    /// numbered short name on collision and writing LFN entries bottom
    /// first. Leaves the iterator at the short entry.
    pub(crate) fn register(&mut self, vol: &mut Volume) -> Result<(), FatError> {
        let sn = self.fname;

        if sn[NS] & NS_LOSS != 0 {
            // The long name does not fit 8.3: find a free numbered name.
            self.fname[NS] = 0;
            self.use_lfn = false;
            let mut n = 1u32;
            loop {
                gen_numname(&mut self.fname, &sn, &self.lfn, n);
                match self.find(vol) {
                    Ok(()) => {
                        n += 1;
                        if n >= 100 {
                            self.use_lfn = true;
                            return Err(FatError::Denied);
                        }
                    }
                    Err(FatError::NoFile) => break,
                    Err(e) => {
                        self.use_lfn = true;
                        return Err(e);
                    }
                }
            }
            self.fname[NS] = sn[NS];
            self.use_lfn = true;
        }

        let nent = if sn[NS] & NS_LFN != 0 {
            let mut n = 0;
            while self.lfn[n] != 0 {
                n += 1;
            }
            (n as u32 + 25) / 13
        } else {
            1
        };

        self.alloc(vol, nent)?;

        let mut nent = nent - 1;
        if nent > 0 {
            // Store the LFN entries, bottom first.
            self.sdi(vol, self.index as u32 - nent)?;
            let sum = sum_sfn(&self.fname);
            loop {
                vol.move_window(self.sect)?;
                let off = self.win_off;
                fit_lfn(&self.lfn, &mut vol.win[off..off + SZ_DIR], nent as u8, sum);
                vol.wflag = true;
                self.next(vol, false)?;
                nent -= 1;
                if nent == 0 {
                    break;
                }
            }
        }

        // Store the short entry.
        vol.move_window(self.sect)?;
        let off = self.win_off;
        vol.win[off..off + SZ_DIR].fill(0);
        vol.win[off..off + 11].copy_from_slice(&self.fname[..11]);
        vol.win[off + DIR_NTRES] = self.fname[NS] & (crate::name::NS_BODY | crate::name::NS_EXT);
        vol.wflag = true;

        Ok(())
    }

    /// Removes the object the iterator points at, sweeping the deleted
    /// mark over the LFN entries and the short entry.
    pub(crate) fn remove(&mut self, vol: &mut Volume) -> Result<(), FatError> {
        let sfn_index = self.index;
        let start = if self.lfn_idx == 0xFFFF {
            sfn_index
        } else {
            self.lfn_idx
        };
        self.sdi(vol, start as u32)?;

        loop {
            vol.move_window(self.sect)?;
            let off = self.win_off;
            vol.win[off..off + SZ_DIR].fill(0);
            vol.win[off] = DDE;
            vol.wflag = true;
            if self.index >= sfn_index {
                break;
            }
            match self.next(vol, false) {
                Ok(()) => {}
                Err(FatError::NoFile) => return Err(FatError::IntErr),
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    /// Decodes the entry the iterator points at. The window must still
    /// hold the entry's sector.
    pub(crate) fn fileinfo(&self, vol: &Volume) -> FileInfo {
        let ent = &vol.win[self.win_off..self.win_off + SZ_DIR];

        let mut fname = String::new();
        let ntres = ent[DIR_NTRES];
        for i in 0..11 {
            let mut c = ent[i];
            if c == b' ' {
                continue;
            }
            if c == NDDE {
                c = DDE;
            }
            if i == 8 {
                fname.push('.');
            }
            let lower = ntres
                & (if i >= 8 {
                    crate::name::NS_EXT
                } else {
                    crate::name::NS_BODY
                })
                != 0;
            if c.is_ascii_uppercase() && lower {
                c += 0x20;
            }
            fname.push(vol.codepage.oem_to_unicode(c).unwrap_or('?'));
        }

        let lfname = if self.lfn_idx != 0xFFFF {
            let s: String = self
                .lfn
                .iter()
                .take_while(|&&w| w != 0)
                .filter_map(|&w| char::from_u32(w as u32))
                .collect();
            if s.is_empty() {
                None
            } else {
                Some(s)
            }
        } else {
            None
        };

        FileInfo {
            fname,
            lfname,
            entry: EntryInfo {
                attr: ent[DIR_ATTR],
                sclust: ld_clust(vol, ent),
                size: ld_dword(&ent[DIR_FILE_SIZE..]),
                fdate: ld_word(&ent[DIR_WRT_DATE..]),
                ftime: ld_word(&ent[DIR_WRT_TIME..]),
                pos: DirPos {
                    sclust: self.sclust,
                    index: self.index,
                },
            },
        }
    }
}

/// Loads the start cluster from a directory entry.
pub(crate) fn ld_clust(vol: &Volume, ent: &[u8]) -> u32 {
    let mut cl = ld_word(&ent[DIR_FST_CLUS_LO..]) as u32;
    if vol.fs_type == FatType::Fat32 {
        cl |= (ld_word(&ent[DIR_FST_CLUS_HI..]) as u32) << 16;
    }
    cl
}

/// Stores a start cluster into a directory entry.
pub(crate) fn st_clust(ent: &mut [u8], cl: u32) {
    st_word(&mut ent[DIR_FST_CLUS_LO..], cl as u16);
    st_word(&mut ent[DIR_FST_CLUS_HI..], (cl >> 16) as u16);
}

impl Volume {
    /// Looks `name` up in the directory table starting at `dsclust`.
    pub(crate) fn find_entry(
        &mut self,
        dsclust: u32,
        name: &str,
    ) -> Result<(Dir, EntryInfo), FatError> {
        let mut dj = Dir::new(dsclust);
        create_name(&mut dj, self.codepage, name)?;
        dj.find(self)?;
        let info = dj.fileinfo(self).entry;
        Ok((dj, info))
    }

    /// Creates a blank regular-file entry for `name`, stamping the
    /// creation time.
    pub(crate) fn create_entry(&mut self, dsclust: u32, name: &str) -> Result<EntryInfo, FatError> {
        if self.readonly {
            return Err(FatError::WriteProtected);
        }

        let mut dj = Dir::new(dsclust);
        create_name(&mut dj, self.codepage, name)?;
        match dj.find(self) {
            Ok(()) => return Err(FatError::Exist),
            Err(FatError::NoFile) => {}
            Err(e) => return Err(e),
        }
        dj.register(self)?;

        let tm = (self.clock)();
        let off = dj.win_off;
        st_dword(&mut self.win[off + DIR_CRT_TIME..], tm);
        st_dword(&mut self.win[off + DIR_WRT_TIME..], tm);
        self.wflag = true;
        self.sync_fs()?;

        // Re-read the entry: register left the window on it.
        self.move_window(dj.sect)?;
        let info = dj.fileinfo(self).entry;
        Ok(info)
    }

    /// Removes the entry `name` in `dsclust`. `want_dir` selects unlink
    /// (`false`) or rmdir (`true`) semantics; directories must be empty.
    pub(crate) fn unlink_entry(
        &mut self,
        dsclust: u32,
        name: &str,
        want_dir: bool,
    ) -> Result<DirPos, FatError> {
        if self.readonly {
            return Err(FatError::WriteProtected);
        }

        let (mut dj, info) = self.find_entry(dsclust, name)?;

        // Refuse while the object is open.
        lock::chk_lock(self.id, &info.pos, 2)?;

        if info.attr & attr::AM_RDO != 0 {
            return Err(FatError::Denied);
        }
        let is_dir = info.attr & attr::AM_DIR != 0;
        if is_dir != want_dir {
            return Err(if is_dir {
                FatError::Denied
            } else {
                FatError::NoPath
            });
        }

        let dclst = info.sclust;
        if is_dir {
            if dclst < 2 {
                return Err(FatError::IntErr);
            }
            // The table must hold nothing beyond the two dot entries.
            let mut sdj = Dir::new(dclst);
            sdj.sdi(self, 2)?;
            match sdj.read(self, false) {
                Ok(()) => return Err(FatError::Denied),
                Err(FatError::NoFile) => {}
                Err(e) => return Err(e),
            }
        }

        dj.remove(self)?;
        if dclst != 0 {
            self.remove_chain(dclst)?;
        }
        self.sync_fs()?;
        Ok(info.pos)
    }

    /// Creates a directory `name` under `dsclust` with its dot entries.
    pub(crate) fn mkdir_entry(&mut self, dsclust: u32, name: &str) -> Result<(), FatError> {
        if self.readonly {
            return Err(FatError::WriteProtected);
        }

        let mut dj = Dir::new(dsclust);
        create_name(&mut dj, self.codepage, name)?;
        match dj.find(self) {
            Ok(()) => return Err(FatError::Exist),
            Err(FatError::NoFile) => {}
            Err(e) => return Err(e),
        }

        let tm = (self.clock)();
        let dcl = match self.create_chain(0) {
            0 => return Err(FatError::Denied),
            1 => return Err(FatError::IntErr),
            0xFFFF_FFFF => return Err(FatError::DiskErr),
            c => c,
        };
        self.sync_window()?;

        // Initialize the new table: dot entries, then zeroed sectors.
        let mut dsc = self.clust2sect(dcl);
        self.win.fill(0);
        self.win[..11].fill(b' ');
        self.win[0] = b'.';
        self.win[DIR_ATTR] = attr::AM_DIR;
        st_dword(&mut self.win[DIR_WRT_TIME..], tm);
        st_clust(&mut self.win[..SZ_DIR], dcl);
        let (first, second) = self.win.split_at_mut(SZ_DIR);
        second[..SZ_DIR].copy_from_slice(first);
        second[1] = b'.';
        let mut pcl = dj.sclust;
        if self.fs_type == FatType::Fat32 && pcl as u64 == self.dirbase {
            pcl = 0;
        }
        st_clust(&mut self.win[SZ_DIR..2 * SZ_DIR], pcl);
        for _ in 0..self.csize {
            self.winsect = dsc;
            dsc += 1;
            self.wflag = true;
            let res = self.sync_window();
            if let Err(e) = res {
                return Err(e);
            }
            self.win.fill(0);
        }

        // Register the new table in the parent.
        match dj.register(self) {
            Err(e) => {
                let _ = self.remove_chain(dcl);
                Err(e)
            }
            Ok(()) => {
                let off = dj.win_off;
                self.win[off + DIR_ATTR] = attr::AM_DIR;
                st_dword(&mut self.win[off + DIR_WRT_TIME..], tm);
                st_clust(&mut self.win[off..off + SZ_DIR], dcl);
                self.wflag = true;
                self.sync_fs()
            }
        }
    }

    /// Renames `old_name` in `old_dsclust` to `new_name` under
    /// `new_dsclust`, fixing the `..` entry when a directory changes
    /// parents. The whole sequence runs inside one volume lock hold.
    pub(crate) fn rename_entry(
        &mut self,
        old_dsclust: u32,
        old_name: &str,
        new_dsclust: u32,
        new_name: &str,
    ) -> Result<(), FatError> {
        if self.readonly {
            return Err(FatError::WriteProtected);
        }

        let (mut djo, info) = self.find_entry(old_dsclust, old_name)?;
        lock::chk_lock(self.id, &info.pos, 2)?;

        // Snapshot the object information except the name.
        let off = djo.win_off;
        let mut buf = [0u8; 21];
        buf.copy_from_slice(&self.win[off + DIR_ATTR..off + SZ_DIR]);

        let mut djn = Dir::new(new_dsclust);
        create_name(&mut djn, self.codepage, new_name)?;
        match djn.find(self) {
            Ok(()) => return Err(FatError::Exist),
            Err(FatError::NoFile) => {}
            Err(e) => return Err(e),
        }

        djn.register(self)?;
        let off = djn.win_off;
        self.win[off + 13..off + SZ_DIR].copy_from_slice(&buf[2..]);
        self.win[off + DIR_ATTR] = buf[0] | attr::AM_ARC;
        self.wflag = true;

        if djo.sclust != djn.sclust && self.win[off + DIR_ATTR] & attr::AM_DIR != 0 {
            // A directory moved to another parent: update its `..` entry.
            let ent: [u8; SZ_DIR] = self.win[off..off + SZ_DIR].try_into().unwrap();
            let dw = self.clust2sect(ld_clust(self, &ent));
            if dw == 0 {
                return Err(FatError::IntErr);
            }
            self.move_window(dw)?;
            if self.win[SZ_DIR + 1] == b'.' {
                let mut cl = djn.sclust;
                if self.fs_type == FatType::Fat32 && cl as u64 == self.dirbase {
                    cl = 0;
                }
                st_clust(&mut self.win[SZ_DIR..2 * SZ_DIR], cl);
                self.wflag = true;
            }
        }

        djo.remove(self)?;
        self.sync_fs()
    }

    /// Positions a fresh iterator on a known entry and loads its sector
    /// into the window.
    pub(crate) fn entry_at(&mut self, pos: DirPos) -> Result<Dir, FatError> {
        let mut dj = Dir::new(pos.sclust);
        dj.sdi(self, pos.index as u32)?;
        self.move_window(dj.sect)?;
        Ok(dj)
    }

    /// Applies `value` under `mask` to the attribute byte of an entry.
    pub(crate) fn chmod_entry(
        &mut self,
        pos: DirPos,
        value: u8,
        mask: u8,
    ) -> Result<(), FatError> {
        if self.readonly {
            return Err(FatError::WriteProtected);
        }
        let dj = self.entry_at(pos)?;
        let mask = mask & (attr::AM_RDO | attr::AM_HID | attr::AM_SYS | attr::AM_ARC);
        let off = dj.win_off;
        let old = self.win[off + DIR_ATTR];
        self.win[off + DIR_ATTR] = (value & mask) | (old & !mask);
        self.wflag = true;
        self.sync_fs()
    }

    /// Sets the modification timestamp of an entry.
    pub(crate) fn utime_entry(
        &mut self,
        pos: DirPos,
        fdate: u16,
        ftime: u16,
    ) -> Result<(), FatError> {
        if self.readonly {
            return Err(FatError::WriteProtected);
        }
        let dj = self.entry_at(pos)?;
        let off = dj.win_off;
        st_word(&mut self.win[off + DIR_WRT_TIME..], ftime);
        st_word(&mut self.win[off + DIR_WRT_DATE..], fdate);
        self.wflag = true;
        self.sync_fs()
    }

    /// Reads the object at or after `index` in the table at `dsclust`.
    /// Returns the decoded object and the index to continue from, or
    /// `None` at the end of the table.
    pub(crate) fn read_entries(
        &mut self,
        dsclust: u32,
        index: u32,
    ) -> Result<Option<(FileInfo, u32)>, FatError> {
        if index > u16::MAX as u32 {
            return Ok(None);
        }
        let mut dj = Dir::new(dsclust);
        match dj.sdi(self, index) {
            Ok(()) => {}
            // Past the end of the table.
            Err(FatError::IntErr) => return Ok(None),
            Err(e) => return Err(e),
        }
        match dj.read(self, false) {
            Ok(()) => {}
            Err(FatError::NoFile) => return Ok(None),
            Err(e) => return Err(e),
        }
        let fi = dj.fileinfo(self);
        let next = match dj.next(self, false) {
            Ok(()) => dj.index as u32,
            Err(FatError::NoFile) => u16::MAX as u32 + 1,
            Err(e) => return Err(e),
        };
        Ok(Some((fi, next)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{mkfat, mount_img, FatKind};

    #[test]
    fn test_sdi_static_root_bounds() {
        let mut vol = mount_img(mkfat(FatKind::Fat12, 64));
        let mut dj = Dir::new(0);
        dj.sdi(&mut vol, 0).unwrap();
        assert_eq!(dj.sect, vol.dirbase);
        // The seeded root has 512 entries.
        assert_eq!(dj.sdi(&mut vol, 512).unwrap_err(), FatError::IntErr);
    }

    #[test]
    fn test_create_and_find() {
        let mut vol = mount_img(mkfat(FatKind::Fat12, 64));
        let info = vol.create_entry(0, "HELLO.TXT").unwrap();
        assert_eq!(info.size, 0);
        assert_eq!(info.sclust, 0);

        let (_, found) = vol.find_entry(0, "HELLO.TXT").unwrap();
        assert_eq!(found.pos, info.pos);
        // FAT name matching is case-insensitive.
        let (_, found) = vol.find_entry(0, "hello.txt").unwrap();
        assert_eq!(found.pos, info.pos);

        assert_eq!(
            vol.find_entry(0, "OTHER.TXT").unwrap_err(),
            FatError::NoFile
        );
    }

    #[test]
    fn test_create_twice_is_exist() {
        let mut vol = mount_img(mkfat(FatKind::Fat12, 64));
        vol.create_entry(0, "A.TXT").unwrap();
        assert_eq!(vol.create_entry(0, "A.TXT").unwrap_err(), FatError::Exist);
    }

    #[test]
    fn test_lfn_roundtrip_on_disk() {
        let mut vol = mount_img(mkfat(FatKind::Fat12, 64));
        vol.create_entry(0, "My Long Name.txt").unwrap();

        // The short form is the first numbered name.
        let (dj, _) = vol.find_entry(0, "MYLONG~1.TXT").unwrap();
        drop(dj);
        // Finding by long name accumulates the stored LFN entries.
        let (mut dj, _) = vol.find_entry(0, "My Long Name.txt").unwrap();
        assert_ne!(dj.lfn_idx, 0xFFFF);

        // Reading back decodes the original long name.
        dj.sdi(&mut vol, 0).unwrap();
        dj.read(&mut vol, false).unwrap();
        let fi = dj.fileinfo(&vol);
        assert_eq!(fi.name(), "My Long Name.txt");
        assert_eq!(fi.fname, "MYLONG~1.TXT");
    }

    #[test]
    fn test_numbered_collision() {
        let mut vol = mount_img(mkfat(FatKind::Fat12, 64));
        vol.create_entry(0, "My Long Name A.txt").unwrap();
        vol.create_entry(0, "My Long Name B.txt").unwrap();
        assert!(vol.find_entry(0, "MYLONG~1.TXT").is_ok());
        assert!(vol.find_entry(0, "MYLONG~2.TXT").is_ok());
    }

    #[test]
    fn test_mkdir_dot_entries() {
        let mut vol = mount_img(mkfat(FatKind::Fat16, 4100));
        vol.mkdir_entry(0, "SUB").unwrap();
        let (_, info) = vol.find_entry(0, "SUB").unwrap();
        assert!(info.attr & attr::AM_DIR != 0);
        assert!(info.sclust >= 2);

        // "." points at the table itself, ".." at the root (0).
        let sect = vol.clust2sect(info.sclust);
        vol.move_window(sect).unwrap();
        assert_eq!(&vol.win[0..2], b". ");
        assert_eq!(&vol.win[SZ_DIR..SZ_DIR + 2], b"..");
        let dot: [u8; SZ_DIR] = vol.win[..SZ_DIR].try_into().unwrap();
        let dotdot: [u8; SZ_DIR] = vol.win[SZ_DIR..2 * SZ_DIR].try_into().unwrap();
        assert_eq!(ld_clust(&vol, &dot), info.sclust);
        assert_eq!(ld_clust(&vol, &dotdot), 0);
    }

    #[test]
    fn test_unlink_refuses_nonempty_dir() {
        let mut vol = mount_img(mkfat(FatKind::Fat16, 4100));
        vol.mkdir_entry(0, "SUB").unwrap();
        let (_, info) = vol.find_entry(0, "SUB").unwrap();
        vol.create_entry(info.sclust, "INNER.TXT").unwrap();

        assert_eq!(
            vol.unlink_entry(0, "SUB", true).unwrap_err(),
            FatError::Denied
        );
        vol.unlink_entry(info.sclust, "INNER.TXT", false).unwrap();
        vol.unlink_entry(0, "SUB", true).unwrap();
        assert_eq!(vol.find_entry(0, "SUB").unwrap_err(), FatError::NoFile);
    }

    #[test]
    fn test_unlink_removes_lfn_entries() {
        let mut vol = mount_img(mkfat(FatKind::Fat12, 64));
        vol.create_entry(0, "My Long Name.txt").unwrap();
        vol.unlink_entry(0, "My Long Name.txt", false).unwrap();

        // Every entry of the object is gone, including the LFN chain.
        let mut dj = Dir::new(0);
        dj.sdi(&mut vol, 0).unwrap();
        assert_eq!(dj.read(&mut vol, false).unwrap_err(), FatError::NoFile);
        // And the slots are reusable.
        vol.create_entry(0, "NEW.TXT").unwrap();
    }

    #[test]
    fn test_rename_within_dir() {
        let mut vol = mount_img(mkfat(FatKind::Fat12, 64));
        let info = vol.create_entry(0, "OLD.TXT").unwrap();
        vol.rename_entry(0, "OLD.TXT", 0, "NEW.TXT").unwrap();
        assert_eq!(vol.find_entry(0, "OLD.TXT").unwrap_err(), FatError::NoFile);
        let (_, found) = vol.find_entry(0, "NEW.TXT").unwrap();
        assert_eq!(found.sclust, info.sclust);
        assert_eq!(found.size, info.size);
    }

    #[test]
    fn test_rename_dir_across_parents_fixes_dotdot() {
        let mut vol = mount_img(mkfat(FatKind::Fat16, 4100));
        vol.mkdir_entry(0, "A").unwrap();
        vol.mkdir_entry(0, "B").unwrap();
        let (_, a) = vol.find_entry(0, "A").unwrap();
        let (_, b) = vol.find_entry(0, "B").unwrap();

        // Move B under A.
        vol.rename_entry(0, "B", a.sclust, "B").unwrap();
        let (_, b2) = vol.find_entry(a.sclust, "B").unwrap();
        assert_eq!(b2.sclust, b.sclust);

        let sect = vol.clust2sect(b.sclust);
        vol.move_window(sect).unwrap();
        let dotdot: [u8; SZ_DIR] = vol.win[SZ_DIR..2 * SZ_DIR].try_into().unwrap();
        assert_eq!(ld_clust(&vol, &dotdot), a.sclust);
    }

    #[test]
    fn test_read_entries_iteration() {
        let mut vol = mount_img(mkfat(FatKind::Fat12, 64));
        vol.create_entry(0, "ONE.TXT").unwrap();
        vol.create_entry(0, "TWO.TXT").unwrap();
        vol.mkdir_entry(0, "DIR").unwrap();

        let mut names = alloc::vec::Vec::new();
        let mut idx = 0u32;
        while let Some((fi, next)) = vol.read_entries(0, idx).unwrap() {
            names.push(alloc::string::String::from(fi.name()));
            idx = next;
        }
        assert_eq!(names, ["ONE.TXT", "TWO.TXT", "DIR"]);
    }

    #[test]
    fn test_static_root_overflow_is_denied() {
        // A FAT12 root with 512 entries: the 513th registration fails.
        let mut vol = mount_img(mkfat(FatKind::Fat12, 700));
        let mut made = 0u32;
        let err = loop {
            let name = alloc::format!("F{:06}.TXT", made);
            match vol.create_entry(0, &name) {
                Ok(_) => made += 1,
                Err(e) => break e,
            }
        };
        assert_eq!(made, 512);
        assert_eq!(err, FatError::Denied);
    }

    #[test]
    fn test_chmod_and_utime() {
        let mut vol = mount_img(mkfat(FatKind::Fat12, 64));
        let info = vol.create_entry(0, "F.TXT").unwrap();

        vol.chmod_entry(info.pos, attr::AM_RDO, attr::AM_RDO).unwrap();
        let (_, found) = vol.find_entry(0, "F.TXT").unwrap();
        assert!(found.attr & attr::AM_RDO != 0);

        vol.utime_entry(info.pos, 0x5321, 0x4800).unwrap();
        let (_, found) = vol.find_entry(0, "F.TXT").unwrap();
        assert_eq!(found.fdate, 0x5321);
        assert_eq!(found.ftime, 0x4800);
    }
}
