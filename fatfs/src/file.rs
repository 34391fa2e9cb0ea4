//! # File Operations
//!
//! The open-file engine: handles carry the cluster walk state, a private
//! data-sector buffer, and the location of the backing directory entry so
//! `sync` can write size, start cluster, and timestamps back.
//!
//! Reads and writes move whole contiguous sector runs directly between
//! the caller's buffer and the device; only partial sectors go through
//! the handle's sector cache. When a direct transfer overlaps the cached
//! sector, the dirty side wins.

use alloc::vec;
use alloc::vec::Vec;
use bitflags::bitflags;

use crate::dir::{st_clust, DirPos};
use crate::lock;
use crate::offsets::*;
use crate::volume::Volume;
use crate::{attr, st_dword, st_word, FatError, SZ_DIR};

bitflags! {
    /// File open mode.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenMode: u8 {
        /// Open for reading
        const READ = 0x01;
        /// Open for writing
        const WRITE = 0x02;
        /// Truncate an existing file on open
        const CREATE_ALWAYS = 0x08;
    }
}

/// An open file handle.
///
/// A handle belongs to a single volume generation: it records the mount
/// id at open time and every operation re-validates it, so a handle that
/// survives a remount fails cleanly instead of corrupting the volume.
#[derive(Debug)]
pub struct FatFile {
    /// Mount id of the owning volume at open time
    pub(crate) id: u32,
    pub(crate) mode: OpenMode,
    /// Sticky error: once set, further I/O is refused until close
    pub(crate) err: Option<FatError>,
    /// First cluster (0: no data allocated)
    pub(crate) sclust: u32,
    /// Current cluster of the file pointer
    pub(crate) clust: u32,
    /// File pointer
    pub(crate) fptr: u32,
    /// File size
    pub(crate) fsize: u32,
    /// Sector held in the private buffer (0: none)
    pub(crate) dsect: u64,
    /// Private buffer dirty flag
    pub(crate) dirty: bool,
    /// File has been written since the last sync
    pub(crate) written: bool,
    /// Sector holding the backing directory entry
    pub(crate) dir_sect: u64,
    /// Offset of the entry within that sector
    pub(crate) dir_off: usize,
    /// Open-file lock slot (1-based)
    pub(crate) lockid: usize,
    /// Private data-sector buffer
    pub(crate) buf: Vec<u8>,
    /// Cluster link map for fast seek, built on request
    pub(crate) cltbl: Option<Vec<u32>>,
}

impl FatFile {
    /// Current file size.
    pub fn size(&self) -> u32 {
        self.fsize
    }

    /// Current file pointer.
    pub fn tell(&self) -> u32 {
        self.fptr
    }
}

fn abort(fp: &mut FatFile, e: FatError) -> FatError {
    fp.err = Some(e);
    e
}

/// Maps a file offset to its cluster through the link map table.
/// Returns 0 past the end of the table.
fn clmt_clust(fp: &FatFile, ofs: u32, ss: usize, csize: u32) -> u32 {
    let tbl = match &fp.cltbl {
        Some(t) => t,
        None => return 0,
    };
    let mut cl = ofs / ss as u32 / csize;
    let mut i = 1usize;
    loop {
        let ncl = match tbl.get(i) {
            Some(&n) => n,
            None => return 0,
        };
        i += 1;
        if ncl == 0 {
            return 0;
        }
        if cl < ncl {
            break;
        }
        cl -= ncl;
        i += 1;
    }
    cl + tbl[i]
}

impl Volume {
    /// Stale-handle check: the handle must belong to this mount
    /// generation and the device must still be live.
    pub(crate) fn validate(&self, fp: &FatFile) -> Result<(), FatError> {
        if fp.id != self.id {
            return Err(FatError::InvalidObject);
        }
        if self
            .dev
            .status()
            .contains(onyx_block::DeviceStatus::NOINIT)
        {
            return Err(FatError::InvalidObject);
        }
        Ok(())
    }

    /// Opens the file whose directory entry sits at `pos`.
    ///
    /// With `CREATE_ALWAYS` an existing file is truncated: the old chain
    /// is freed for reuse, the size reset, and the creation time
    /// restamped.
    pub(crate) fn open_node(&mut self, pos: DirPos, mode: OpenMode) -> Result<FatFile, FatError> {
        if mode.intersects(OpenMode::WRITE | OpenMode::CREATE_ALWAYS) && self.readonly {
            return Err(FatError::WriteProtected);
        }

        let dj = self.entry_at(pos)?;
        let off = dj.win_off;
        let ent_attr = self.win[off + DIR_ATTR];
        if ent_attr & attr::AM_DIR != 0 {
            return Err(FatError::NoFile);
        }
        let write = mode.contains(OpenMode::WRITE);
        if write && ent_attr & attr::AM_RDO != 0 {
            return Err(FatError::Denied);
        }

        lock::chk_lock(self.id, &pos, if write { 1 } else { 0 })?;

        let mut written = false;
        if mode.contains(OpenMode::CREATE_ALWAYS) {
            // Truncate: reset the entry and recycle the cluster chain.
            let tm = (self.clock)();
            st_dword(&mut self.win[off + DIR_CRT_TIME..], tm);
            self.win[off + DIR_ATTR] = 0;
            st_dword(&mut self.win[off + DIR_FILE_SIZE..], 0);
            let ent: [u8; SZ_DIR] = self.win[off..off + SZ_DIR].try_into().unwrap();
            let cl = crate::dir::ld_clust(self, &ent);
            st_clust(&mut self.win[off..off + SZ_DIR], 0);
            self.wflag = true;
            if cl != 0 {
                let dw = self.winsect;
                self.remove_chain(cl)?;
                self.last_clust = cl - 1; /* reuse the cluster hole */
                self.move_window(dw)?;
            }
            written = true;
        }

        let lockid = lock::inc_lock(self.id, &pos, if write { 1 } else { 0 });
        if lockid == 0 {
            return Err(FatError::TooManyOpenFiles);
        }

        let off = dj.win_off;
        let ent: [u8; SZ_DIR] = self.win[off..off + SZ_DIR].try_into().unwrap();
        Ok(FatFile {
            id: self.id,
            mode,
            err: None,
            sclust: crate::dir::ld_clust(self, &ent),
            clust: 0,
            fptr: 0,
            fsize: crate::ld_dword(&ent[DIR_FILE_SIZE..]),
            dsect: 0,
            dirty: false,
            written,
            dir_sect: self.winsect,
            dir_off: off,
            lockid,
            buf: vec![0u8; self.ssize],
            cltbl: None,
        })
    }

    /// Reads from the file at its pointer, bounded by the file size.
    pub fn read(&mut self, fp: &mut FatFile, buff: &mut [u8]) -> Result<usize, FatError> {
        self.validate(fp)?;
        if let Some(e) = fp.err {
            return Err(e);
        }
        if !fp.mode.contains(OpenMode::READ) {
            return Err(FatError::Denied);
        }

        let ss = self.ssize;
        let remain = (fp.fsize - fp.fptr) as usize;
        let mut btr = buff.len().min(remain);
        let mut br = 0usize;

        while btr > 0 {
            let rcnt;
            if fp.fptr as usize % ss == 0 {
                // Sector boundary.
                let csect = (fp.fptr / ss as u32) & (self.csize - 1);
                if csect == 0 {
                    // Cluster boundary: follow the chain.
                    let clst = if fp.fptr == 0 {
                        fp.sclust
                    } else if fp.cltbl.is_some() {
                        clmt_clust(fp, fp.fptr, ss, self.csize)
                    } else {
                        self.get_fat(fp.clust)
                    };
                    if clst < 2 {
                        return Err(abort(fp, FatError::IntErr));
                    }
                    if clst == 0xFFFF_FFFF {
                        return Err(abort(fp, FatError::DiskErr));
                    }
                    fp.clust = clst;
                }
                let mut sect = self.clust2sect(fp.clust);
                if sect == 0 {
                    return Err(abort(fp, FatError::IntErr));
                }
                sect += csect as u64;

                let mut cc = btr / ss;
                if cc > 0 {
                    // Direct transfer of whole sectors, clipped at the
                    // cluster boundary.
                    if csect + cc as u32 > self.csize {
                        cc = (self.csize - csect) as usize;
                    }
                    if self
                        .dev
                        .read(&mut buff[br..br + cc * ss], sect, cc)
                        .is_err()
                    {
                        return Err(abort(fp, FatError::DiskErr));
                    }
                    // The cached sector may be dirtier than the disk.
                    if !self.readonly && fp.dirty && fp.dsect >= sect {
                        let o = (fp.dsect - sect) as usize;
                        if o < cc {
                            buff[br + o * ss..br + (o + 1) * ss].copy_from_slice(&fp.buf);
                        }
                    }
                    rcnt = cc * ss;
                    fp.fptr += rcnt as u32;
                    br += rcnt;
                    btr -= rcnt;
                    continue;
                }

                if fp.dsect != sect {
                    // Refill the private sector cache.
                    if !self.readonly && fp.dirty {
                        if self.dev.write(&fp.buf, fp.dsect, 1).is_err() {
                            return Err(abort(fp, FatError::DiskErr));
                        }
                        fp.dirty = false;
                    }
                    if self.dev.read(&mut fp.buf, sect, 1).is_err() {
                        return Err(abort(fp, FatError::DiskErr));
                    }
                }
                fp.dsect = sect;
            }

            let off = fp.fptr as usize % ss;
            rcnt = (ss - off).min(btr);
            buff[br..br + rcnt].copy_from_slice(&fp.buf[off..off + rcnt]);
            fp.fptr += rcnt as u32;
            br += rcnt;
            btr -= rcnt;
        }

        Ok(br)
    }

    /// Writes to the file at its pointer, allocating clusters as needed.
    /// Running out of space stops with a short count.
    pub fn write(&mut self, fp: &mut FatFile, buff: &[u8]) -> Result<usize, FatError> {
        self.validate(fp)?;
        if let Some(e) = fp.err {
            return Err(e);
        }
        if !fp.mode.contains(OpenMode::WRITE) {
            return Err(FatError::Denied);
        }

        let ss = self.ssize;
        let mut btw = buff.len();
        if (fp.fptr as u64 + btw as u64) > u32::MAX as u64 {
            btw = 0; /* the file size cannot reach 4 GiB */
        }
        let mut bw = 0usize;

        while btw > 0 {
            let wcnt;
            if fp.fptr as usize % ss == 0 {
                let csect = (fp.fptr / ss as u32) & (self.csize - 1);
                if csect == 0 {
                    // Cluster boundary: follow or stretch the chain.
                    let clst = if fp.fptr == 0 {
                        if fp.sclust == 0 {
                            self.create_chain(0)
                        } else {
                            fp.sclust
                        }
                    } else if fp.cltbl.is_some() {
                        clmt_clust(fp, fp.fptr, ss, self.csize)
                    } else {
                        self.create_chain(fp.clust)
                    };
                    if clst == 0 {
                        break; /* disk full: stop with a short count */
                    }
                    if clst == 1 {
                        return Err(abort(fp, FatError::IntErr));
                    }
                    if clst == 0xFFFF_FFFF {
                        return Err(abort(fp, FatError::DiskErr));
                    }
                    fp.clust = clst;
                    if fp.sclust == 0 {
                        fp.sclust = clst; /* first ever write */
                    }
                }

                if fp.dirty {
                    // Write back the sector cache before moving on.
                    if self.dev.write(&fp.buf, fp.dsect, 1).is_err() {
                        return Err(abort(fp, FatError::DiskErr));
                    }
                    fp.dirty = false;
                }

                let mut sect = self.clust2sect(fp.clust);
                if sect == 0 {
                    return Err(abort(fp, FatError::IntErr));
                }
                sect += csect as u64;

                let mut cc = btw / ss;
                if cc > 0 {
                    // Direct transfer of whole sectors.
                    if csect + cc as u32 > self.csize {
                        cc = (self.csize - csect) as usize;
                    }
                    if self.dev.write(&buff[bw..bw + cc * ss], sect, cc).is_err() {
                        return Err(abort(fp, FatError::DiskErr));
                    }
                    if fp.dsect >= sect {
                        // Refill an overlapped sector cache from the data
                        // just written so it does not go stale.
                        let o = (fp.dsect - sect) as usize;
                        if o < cc {
                            fp.buf.copy_from_slice(&buff[bw + o * ss..bw + (o + 1) * ss]);
                            fp.dirty = false;
                        }
                    }
                    wcnt = cc * ss;
                    fp.fptr += wcnt as u32;
                    bw += wcnt;
                    btw -= wcnt;
                    continue;
                }

                if fp.dsect != sect && fp.fptr < fp.fsize {
                    // Partial write inside the file: read-modify-write.
                    if self.dev.read(&mut fp.buf, sect, 1).is_err() {
                        return Err(abort(fp, FatError::DiskErr));
                    }
                }
                fp.dsect = sect;
            }

            let off = fp.fptr as usize % ss;
            wcnt = (ss - off).min(btw);
            fp.buf[off..off + wcnt].copy_from_slice(&buff[bw..bw + wcnt]);
            fp.dirty = true;
            fp.fptr += wcnt as u32;
            bw += wcnt;
            btw -= wcnt;
        }

        if fp.fptr > fp.fsize {
            fp.fsize = fp.fptr;
        }
        fp.written = true;

        Ok(bw)
    }

    /// Moves the file pointer. Read-only handles clip at the file size;
    /// write handles extend the chain when seeking past the end.
    pub fn lseek(&mut self, fp: &mut FatFile, ofs: u32) -> Result<(), FatError> {
        self.validate(fp)?;
        if let Some(e) = fp.err {
            return Err(e);
        }

        let ss = self.ssize;

        if fp.cltbl.is_some() {
            // Fast seek through the cluster link map.
            let ofs = ofs.min(fp.fsize);
            fp.fptr = ofs;
            if ofs > 0 {
                fp.clust = clmt_clust(fp, ofs - 1, ss, self.csize);
                let mut dsc = self.clust2sect(fp.clust);
                if dsc == 0 {
                    return Err(abort(fp, FatError::IntErr));
                }
                dsc += ((ofs - 1) / ss as u32 & (self.csize - 1)) as u64;
                if fp.fptr as usize % ss != 0 && dsc != fp.dsect {
                    if !self.readonly && fp.dirty {
                        if self.dev.write(&fp.buf, fp.dsect, 1).is_err() {
                            return Err(abort(fp, FatError::DiskErr));
                        }
                        fp.dirty = false;
                    }
                    if self.dev.read(&mut fp.buf, dsc, 1).is_err() {
                        return Err(abort(fp, FatError::DiskErr));
                    }
                    fp.dsect = dsc;
                }
            }
            return Ok(());
        }

        let mut ofs = ofs;
        if self.readonly || !fp.mode.contains(OpenMode::WRITE) {
            if ofs > fp.fsize {
                ofs = fp.fsize; /* clip at the file size */
            }
        }

        let ifptr = fp.fptr;
        fp.fptr = 0;
        let mut nsect = 0u64;
        if ofs > 0 {
            let bcs = self.csize * ss as u32;
            let mut clst;
            if ifptr > 0 && (ofs - 1) / bcs >= (ifptr - 1) / bcs {
                // Seek to the same or a following cluster: resume from
                // the current one.
                fp.fptr = (ifptr - 1) & !(bcs - 1);
                ofs -= fp.fptr;
                clst = fp.clust;
            } else {
                clst = fp.sclust;
                if !self.readonly && clst == 0 {
                    clst = match self.create_chain(0) {
                        1 => return Err(abort(fp, FatError::IntErr)),
                        0xFFFF_FFFF => return Err(abort(fp, FatError::DiskErr)),
                        c => c,
                    };
                    fp.sclust = clst;
                }
                fp.clust = clst;
            }

            if clst != 0 {
                while ofs > bcs {
                    if !self.readonly && fp.mode.contains(OpenMode::WRITE) {
                        // Force stretch in write mode; clip on a full disk.
                        clst = self.create_chain(clst);
                        if clst == 0 {
                            ofs = bcs;
                            break;
                        }
                    } else {
                        clst = self.get_fat(clst);
                    }
                    if clst == 0xFFFF_FFFF {
                        return Err(abort(fp, FatError::DiskErr));
                    }
                    if clst <= 1 || clst >= self.n_fatent {
                        return Err(abort(fp, FatError::IntErr));
                    }
                    fp.clust = clst;
                    fp.fptr += bcs;
                    ofs -= bcs;
                }
                fp.fptr += ofs;
                if ofs % ss as u32 != 0 {
                    nsect = self.clust2sect(clst);
                    if nsect == 0 {
                        return Err(abort(fp, FatError::IntErr));
                    }
                    nsect += (ofs / ss as u32) as u64;
                }
            }
        }

        if fp.fptr as usize % ss != 0 && nsect != fp.dsect {
            // Land mid-sector somewhere else: refill the cache.
            if !self.readonly && fp.dirty {
                if self.dev.write(&fp.buf, fp.dsect, 1).is_err() {
                    return Err(abort(fp, FatError::DiskErr));
                }
                fp.dirty = false;
            }
            if self.dev.read(&mut fp.buf, nsect, 1).is_err() {
                return Err(abort(fp, FatError::DiskErr));
            }
            fp.dsect = nsect;
        }

        if !self.readonly && fp.fptr > fp.fsize {
            fp.fsize = fp.fptr;
            fp.written = true;
        }

        Ok(())
    }

    /// Builds the cluster link map used by fast seek: pairs of fragment
    /// length and start cluster, terminated by zero.
    pub fn create_linkmap(&mut self, fp: &mut FatFile) -> Result<(), FatError> {
        self.validate(fp)?;

        let mut tbl: Vec<u32> = vec![0];
        let mut cl = fp.sclust;
        if cl != 0 {
            loop {
                let tcl = cl;
                let mut ncl = 0u32;
                loop {
                    let pcl = cl;
                    ncl += 1;
                    cl = self.get_fat(cl);
                    if cl <= 1 {
                        return Err(abort(fp, FatError::IntErr));
                    }
                    if cl == 0xFFFF_FFFF {
                        return Err(abort(fp, FatError::DiskErr));
                    }
                    if cl != pcl + 1 {
                        break;
                    }
                }
                tbl.push(ncl);
                tbl.push(tcl);
                if cl >= self.n_fatent {
                    break;
                }
            }
        }
        tbl.push(0);
        tbl[0] = tbl.len() as u32;
        fp.cltbl = Some(tbl);

        Ok(())
    }

    /// Writes cached data and the directory entry back, then flushes the
    /// volume.
    pub fn sync_file(&mut self, fp: &mut FatFile) -> Result<(), FatError> {
        self.validate(fp)?;

        if fp.written {
            if fp.dirty {
                self.dev
                    .write(&fp.buf, fp.dsect, 1)
                    .map_err(|_| FatError::DiskErr)?;
                fp.dirty = false;
            }

            // Update the directory entry.
            self.move_window(fp.dir_sect)?;
            let off = fp.dir_off;
            self.win[off + DIR_ATTR] |= attr::AM_ARC;
            st_dword(&mut self.win[off + DIR_FILE_SIZE..], fp.fsize);
            st_clust(&mut self.win[off..off + SZ_DIR], fp.sclust);
            let tm = (self.clock)();
            st_dword(&mut self.win[off + DIR_WRT_TIME..], tm);
            st_word(&mut self.win[off + DIR_LST_ACC_DATE..], 0);
            fp.written = false;
            self.wflag = true;
            self.sync_fs()?;
        }

        Ok(())
    }

    /// Closes the handle: syncs on a writable volume, then releases the
    /// lock slot. The handle is spent afterwards even if the sync failed.
    pub fn close_file(&mut self, fp: &mut FatFile) -> Result<(), FatError> {
        self.validate(fp)?;
        let res = if !self.readonly {
            self.sync_file(fp)
        } else {
            Ok(())
        };
        lock::dec_lock(fp.lockid).ok();
        fp.id = u32::MAX; /* invalidated even if the sync failed */
        res
    }

    /// Truncates the file at the current file pointer.
    pub fn truncate(&mut self, fp: &mut FatFile) -> Result<(), FatError> {
        self.validate(fp)?;
        if let Some(e) = fp.err {
            return Err(e);
        }
        if !fp.mode.contains(OpenMode::WRITE) {
            return Err(FatError::Denied);
        }

        let res = (|| {
            if fp.fsize > fp.fptr {
                fp.fsize = fp.fptr;
                fp.written = true;
                if fp.fptr == 0 {
                    // Whole file: drop the entire chain.
                    self.remove_chain(fp.sclust)?;
                    fp.sclust = 0;
                } else {
                    // Split: terminate at the current cluster, free the rest.
                    let ncl = self.get_fat(fp.clust);
                    if ncl == 0xFFFF_FFFF {
                        return Err(FatError::DiskErr);
                    }
                    if ncl == 1 {
                        return Err(FatError::IntErr);
                    }
                    if ncl < self.n_fatent {
                        self.put_fat(fp.clust, 0x0FFF_FFFF)?;
                        self.remove_chain(ncl)?;
                    }
                }

                if fp.dirty {
                    self.dev
                        .write(&fp.buf, fp.dsect, 1)
                        .map_err(|_| FatError::DiskErr)?;
                    fp.dirty = false;
                }
            }
            Ok(())
        })();

        if let Err(e) = res {
            return Err(abort(fp, e));
        }
        Ok(())
    }
}
