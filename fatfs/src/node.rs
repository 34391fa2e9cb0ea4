//! # VFS Adapter
//!
//! Plugs the FAT engine into the VFS: a registered filesystem driver, a
//! superblock per mounted volume, and vnodes backed by an inode cache.
//!
//! FAT has no inode table, so an object's identity is its directory
//! position: the inode number packs the containing table's start cluster
//! with the entry index. The root directory uses a reserved number.
//! `..` and `.` resolve through cached parent links so a directory keeps
//! one vnode no matter which path reached it.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use log::debug;
use spin::Mutex;

use onyx_block::BlockDevice;
use onyx_vfs::{
    self as vfs, Dirent, Errno, FileDesc, FileFlags, FsDriver, Mode, MountFlags, OpenFlags, Stat,
    Superblock, SuperblockOps, Timespec, Vnode, VnodeOps,
};

use crate::codepage::CodePage;
use crate::dir::DirPos;
use crate::file::{FatFile, OpenMode};
use crate::lock;
use crate::time::{dos_to_unix, unix_to_dos};
use crate::attr;
use crate::volume::{MountOptions, Volume};

/// Inode number of the root directory.
pub const ROOT_INO: u64 = u64::MAX;

/// `ioctl` request: build the cluster link map for fast seek.
pub const FAT_IOCTL_CREATE_LINKMAP: u32 = 0x4601;

fn ino_of(pos: DirPos) -> u64 {
    ((pos.sclust as u64) << 32) | pos.index as u64
}

fn mode_from_attr(a: u8) -> Mode {
    if a & attr::AM_DIR != 0 {
        Mode::IFDIR | Mode::from_bits_truncate(0o777)
    } else if a & attr::AM_RDO != 0 {
        Mode::IFREG | Mode::from_bits_truncate(0o444)
    } else {
        Mode::IFREG | Mode::from_bits_truncate(0o666)
    }
}

/// Cached per-object state, keyed by inode number.
#[derive(Clone)]
struct NodeInfo {
    parent_ino: u64,
    /// Directory entry location; `None` for the root
    pos: Option<DirPos>,
    /// Own start cluster (data or directory table; 0 for the root)
    sclust: u32,
    attr: u8,
    size: u32,
    fdate: u16,
    ftime: u16,
}

/// Shared engine handle of all descriptors open on one file vnode.
struct OpenState {
    file: FatFile,
    count: u32,
}

#[derive(Default)]
struct FsState {
    nodes: BTreeMap<u64, NodeInfo>,
    vnodes: BTreeMap<u64, Weak<Vnode>>,
    opens: BTreeMap<u64, OpenState>,
    /// Open directories: lock slot and opener count
    dir_locks: BTreeMap<u64, (usize, u32)>,
}

/// A mounted FAT filesystem instance.
pub struct FatFs {
    me: Weak<FatFs>,
    vol: Mutex<Volume>,
    state: Mutex<FsState>,
    sb: Mutex<Weak<Superblock>>,
    /// Mount id, doubling as the VFS device id
    id: u32,
    ssize: usize,
}

/// Mounted volume table, keyed by mount id. The syscall layer reaches
/// volume-level operations (rename, free count, label) through it.
static MOUNTS: Mutex<alloc::vec::Vec<(u32, Weak<FatFs>)>> = Mutex::new(alloc::vec::Vec::new());

/// The registered driver.
pub struct FatFsDriver;

impl FsDriver for FatFsDriver {
    fn name(&self) -> &'static str {
        "fatfs"
    }

    fn mount(
        &self,
        source: &str,
        flags: MountFlags,
        parm: &str,
    ) -> Result<Arc<Superblock>, Errno> {
        let dev = onyx_block::get_device(source).ok_or(Errno::ENOENT)?;
        FatFs::mount_device(dev, flags, parm)
    }
}

/// Registers the FAT driver with the VFS.
pub fn register_driver() {
    vfs::register(Arc::new(FatFsDriver));
}

impl FatFs {
    /// Mounts a FAT volume from `dev` and wires up the superblock.
    pub fn mount_device(
        dev: Arc<dyn BlockDevice>,
        flags: MountFlags,
        parm: &str,
    ) -> Result<Arc<Superblock>, Errno> {
        let mut opts = MountOptions::default();
        opts.readonly = flags.contains(MountFlags::RDONLY);
        for opt in parm.split(',').filter(|s| !s.is_empty()) {
            if opt == "ro" {
                opts.readonly = true;
            } else if let Some(cp) = opt.strip_prefix("cp=") {
                let id: u16 = cp.parse().map_err(|_| Errno::EINVAL)?;
                opts.codepage = CodePage::by_id(id).ok_or(Errno::EINVAL)?;
            } else {
                return Err(Errno::EINVAL);
            }
        }

        let vol = Volume::mount(dev, opts).map_err(Errno::from)?;
        let id = vol.id();
        let ssize = vol.ssize;

        let fs = Arc::new_cyclic(|me| FatFs {
            me: me.clone(),
            vol: Mutex::new(vol),
            state: Mutex::new(FsState::default()),
            sb: Mutex::new(Weak::new()),
            id,
            ssize,
        });

        let sb = Superblock::new("fatfs", id as u64, fs.clone());
        *fs.sb.lock() = Arc::downgrade(&sb);
        MOUNTS.lock().push((id, Arc::downgrade(&fs)));

        fs.state.lock().nodes.insert(
            ROOT_INO,
            NodeInfo {
                parent_ino: ROOT_INO,
                pos: None,
                sclust: 0,
                attr: attr::AM_DIR,
                size: 0,
                fdate: 0,
                ftime: 0,
            },
        );
        let root = fs.vnode_for(ROOT_INO)?;
        sb.set_root(root);

        Ok(sb)
    }

    /// Finds the filesystem instance behind a mounted superblock.
    pub fn from_superblock(sb: &Superblock) -> Option<Arc<FatFs>> {
        let id = sb.vdev_id() as u32;
        MOUNTS
            .lock()
            .iter()
            .find(|(mid, _)| *mid == id)
            .and_then(|(_, fs)| fs.upgrade())
    }

    fn node_info(&self, ino: u64) -> Result<NodeInfo, Errno> {
        self.state
            .lock()
            .nodes
            .get(&ino)
            .cloned()
            .ok_or(Errno::ENOENT)
    }

    /// Returns a referenced vnode for a cached inode, creating it on
    /// first use.
    fn vnode_for(&self, ino: u64) -> Result<Arc<Vnode>, Errno> {
        let mut state = self.state.lock();

        if let Some(weak) = state.vnodes.get(&ino) {
            if let Some(vn) = weak.upgrade() {
                if vn.vref().is_ok() {
                    return Ok(vn);
                }
            }
        }

        let info = state.nodes.get(&ino).ok_or(Errno::ENOENT)?.clone();
        let ops: Arc<dyn VnodeOps> = self.me.upgrade().ok_or(Errno::ENOENT)?;
        let vn = Vnode::new(ino, mode_from_attr(info.attr), ops, self.sb.lock().clone());
        vn.refset(1);
        state.vnodes.insert(ino, Arc::downgrade(&vn));
        Ok(vn)
    }

    fn cache_entry(&self, parent_ino: u64, entry: &crate::dir::EntryInfo) -> u64 {
        let ino = ino_of(entry.pos);
        self.state.lock().nodes.insert(
            ino,
            NodeInfo {
                parent_ino,
                pos: Some(entry.pos),
                sclust: entry.sclust,
                attr: entry.attr,
                size: entry.size,
                fdate: entry.fdate,
                ftime: entry.ftime,
            },
        );
        ino
    }

    fn forget_entry(&self, ino: u64) {
        let mut state = self.state.lock();
        state.nodes.remove(&ino);
        state.vnodes.remove(&ino);
        state.opens.remove(&ino);
    }

    /// Renames an object. Not part of the vnode operation table; the
    /// syscall layer reaches it through the filesystem handle.
    pub fn rename(
        &self,
        old_dir: &Arc<Vnode>,
        old_name: &str,
        new_dir: &Arc<Vnode>,
        new_name: &str,
    ) -> Result<(), Errno> {
        let old_info = self.node_info(old_dir.num())?;
        let new_info = self.node_info(new_dir.num())?;

        let mut vol = self.vol.lock();
        let (_, entry) = vol.find_entry(old_info.sclust, old_name)?;
        vol.rename_entry(old_info.sclust, old_name, new_info.sclust, new_name)?;
        drop(vol);

        self.forget_entry(ino_of(entry.pos));
        Ok(())
    }

    /// Free-cluster count of the volume.
    pub fn getfree(&self) -> Result<u32, Errno> {
        Ok(self.vol.lock().getfree()?)
    }

    /// Volume label and serial number.
    pub fn getlabel(&self) -> Result<(String, u32), Errno> {
        Ok(self.vol.lock().getlabel()?)
    }
}

impl SuperblockOps for FatFs {
    fn delete_vnode(&self, vnode: &Arc<Vnode>) {
        // The vnode storage goes with the cache slot; the inode metadata
        // stays warm for later lookups.
        self.state.lock().vnodes.remove(&vnode.num());
    }

    fn umount(&self) -> Result<(), Errno> {
        let mut vol = self.vol.lock();
        if !vol.readonly() {
            vol.sync_fs().map_err(Errno::from)?;
        }
        lock::clear_lock(self.id);
        MOUNTS.lock().retain(|(mid, _)| *mid != self.id);
        debug!("fatfs: unmounted volume {}", self.id);
        Ok(())
    }
}

impl VnodeOps for FatFs {
    fn lookup(&self, dir: &Arc<Vnode>, name: &str) -> Result<Arc<Vnode>, Errno> {
        let dir_info = self.node_info(dir.num())?;
        if dir_info.attr & attr::AM_DIR == 0 {
            return Err(Errno::ENOTDIR);
        }

        if name == "." {
            dir.vref()?;
            return Ok(dir.clone());
        }
        if name == ".." {
            if dir.num() == ROOT_INO {
                // At our own root: the resolver exits through the mount.
                return Err(Errno::EDOM);
            }
            return self.vnode_for(dir_info.parent_ino);
        }

        let mut vol = self.vol.lock();
        let (_, entry) = vol.find_entry(dir_info.sclust, name)?;
        drop(vol);

        let ino = self.cache_entry(dir.num(), &entry);
        self.vnode_for(ino)
    }

    fn create(&self, dir: &Arc<Vnode>, name: &str, _mode: Mode) -> Result<Arc<Vnode>, Errno> {
        let dir_info = self.node_info(dir.num())?;
        if dir_info.attr & attr::AM_DIR == 0 {
            return Err(Errno::ENOTDIR);
        }

        let entry = self.vol.lock().create_entry(dir_info.sclust, name)?;
        let ino = self.cache_entry(dir.num(), &entry);
        self.vnode_for(ino)
    }

    fn mkdir(&self, dir: &Arc<Vnode>, name: &str, _mode: Mode) -> Result<(), Errno> {
        let dir_info = self.node_info(dir.num())?;
        if dir_info.attr & attr::AM_DIR == 0 {
            return Err(Errno::ENOTDIR);
        }
        Ok(self.vol.lock().mkdir_entry(dir_info.sclust, name)?)
    }

    fn unlink(&self, dir: &Arc<Vnode>, name: &str) -> Result<(), Errno> {
        let dir_info = self.node_info(dir.num())?;
        let mut vol = self.vol.lock();
        let (_, entry) = vol.find_entry(dir_info.sclust, name)?;
        if entry.attr & attr::AM_DIR != 0 {
            return Err(Errno::EISDIR);
        }
        let pos = vol.unlink_entry(dir_info.sclust, name, false)?;
        drop(vol);

        self.forget_entry(ino_of(pos));
        Ok(())
    }

    fn rmdir(&self, dir: &Arc<Vnode>, name: &str) -> Result<(), Errno> {
        let dir_info = self.node_info(dir.num())?;
        let mut vol = self.vol.lock();
        let (_, entry) = vol.find_entry(dir_info.sclust, name)?;
        if entry.attr & attr::AM_DIR == 0 {
            return Err(Errno::ENOTDIR);
        }
        let pos = vol.unlink_entry(dir_info.sclust, name, true)?;
        drop(vol);

        self.forget_entry(ino_of(pos));
        Ok(())
    }

    fn readdir(&self, dir: &Arc<Vnode>, off: &mut u64) -> Result<Option<Dirent>, Errno> {
        let dir_info = self.node_info(dir.num())?;
        if dir_info.attr & attr::AM_DIR == 0 {
            return Err(Errno::ENOTDIR);
        }

        let index = (*off).min(u16::MAX as u64 + 1) as u32;
        let mut vol = self.vol.lock();
        match vol.read_entries(dir_info.sclust, index)? {
            None => Ok(None),
            Some((fi, next)) => {
                *off = next as u64;
                let d_type = if fi.entry.attr & attr::AM_DIR != 0 {
                    Mode::IFDIR.bits()
                } else {
                    Mode::IFREG.bits()
                };
                Ok(Some(Dirent {
                    d_ino: ino_of(fi.entry.pos),
                    d_type,
                    d_name: String::from(fi.name()),
                }))
            }
        }
    }

    fn stat(&self, vnode: &Arc<Vnode>) -> Result<Stat, Errno> {
        let ino = vnode.num();
        let info = self.node_info(ino)?;
        let size = self
            .state
            .lock()
            .opens
            .get(&ino)
            .map(|o| o.file.fsize)
            .unwrap_or(info.size);

        let mtim = dos_to_unix(info.fdate, info.ftime);
        Ok(Stat {
            st_dev: self.id as u64,
            st_ino: ino,
            st_mode: mode_from_attr(info.attr).bits(),
            st_nlink: 1,
            st_uid: 0,
            st_gid: 0,
            st_size: size as i64,
            st_blksize: self.ssize as u32,
            st_blocks: (size as u64 + 511) / 512,
            st_atim: mtim,
            st_mtim: mtim,
            st_ctim: mtim,
            st_flags: 0,
        })
    }

    fn file_opened(&self, vnode: &Arc<Vnode>, oflags: OpenFlags) -> Result<(), Errno> {
        let ino = vnode.num();
        let info = self.node_info(ino)?;

        if info.attr & attr::AM_DIR != 0 {
            // Directories are locked like the engine's opendir; the root
            // needs no lock entry.
            let pos = match info.pos {
                Some(pos) => pos,
                None => return Ok(()),
            };
            let _vol = self.vol.lock();
            let mut state = self.state.lock();
            if let Some((_, count)) = state.dir_locks.get_mut(&ino) {
                *count += 1;
                return Ok(());
            }
            let lockid = lock::inc_lock(self.id, &pos, 0);
            if lockid == 0 {
                return Err(Errno::ENFILE);
            }
            state.dir_locks.insert(ino, (lockid, 1));
            return Ok(());
        }

        let pos = info.pos.ok_or(Errno::EIO)?;
        let write = oflags.intersects(OpenFlags::WRONLY);
        let mut mode = OpenMode::READ;
        if write {
            mode |= OpenMode::WRITE;
        }
        if write && oflags.contains(OpenFlags::TRUNC) {
            mode |= OpenMode::CREATE_ALWAYS;
        }

        let mut vol = self.vol.lock();
        let mut state = self.state.lock();
        let st = &mut *state;

        if st.opens.contains_key(&ino) {
            // Already open through another descriptor: only compatible
            // readers are admitted, counted in the lock table.
            lock::chk_lock(self.id, &pos, if write { 1 } else { 0 })?;
            if lock::inc_lock(self.id, &pos, 0) == 0 {
                return Err(Errno::ENFILE);
            }
            st.opens.get_mut(&ino).unwrap().count += 1;
            return Ok(());
        }

        let file = vol.open_node(pos, mode)?;
        if let Some(ni) = st.nodes.get_mut(&ino) {
            ni.size = file.fsize;
        }
        st.opens.insert(ino, OpenState { file, count: 1 });
        Ok(())
    }

    fn file_closed(&self, file: &FileDesc) {
        let ino = file.vnode().num();
        let mut vol = self.vol.lock();
        let mut state = self.state.lock();
        let st = &mut *state;

        if let Some((lockid, count)) = st.dir_locks.get_mut(&ino) {
            *count -= 1;
            if *count == 0 {
                lock::dec_lock(*lockid).ok();
                st.dir_locks.remove(&ino);
            }
            return;
        }

        if let Some(open) = st.opens.get_mut(&ino) {
            open.count -= 1;
            if open.count == 0 {
                let mut open = st.opens.remove(&ino).unwrap();
                let _ = vol.close_file(&mut open.file);
                if let Some(ni) = st.nodes.get_mut(&ino) {
                    ni.size = open.file.fsize;
                }
            } else {
                lock::dec_lock(open.file.lockid).ok();
            }
        }
    }

    fn read(&self, file: &FileDesc, buf: &mut [u8]) -> Result<usize, Errno> {
        let ino = file.vnode().num();
        let pos = file.seek_pos();
        if pos < 0 || pos > u32::MAX as i64 {
            return Err(Errno::EINVAL);
        }

        let mut vol = self.vol.lock();
        let mut state = self.state.lock();
        let open = state.opens.get_mut(&ino).ok_or(Errno::EBADF)?;

        vol.lseek(&mut open.file, pos as u32)?;
        let n = vol.read(&mut open.file, buf)?;
        drop(state);
        drop(vol);

        file.set_seek_pos(pos + n as i64);
        Ok(n)
    }

    fn write(&self, file: &FileDesc, buf: &[u8]) -> Result<usize, Errno> {
        let ino = file.vnode().num();

        let mut vol = self.vol.lock();
        let mut state = self.state.lock();
        let st = &mut *state;
        let open = st.opens.get_mut(&ino).ok_or(Errno::EBADF)?;

        let pos = if file.oflags().contains(OpenFlags::APPEND) {
            open.file.fsize as i64
        } else {
            file.seek_pos()
        };
        if pos < 0 || pos > u32::MAX as i64 {
            return Err(Errno::EINVAL);
        }

        vol.lseek(&mut open.file, pos as u32)?;
        let n = vol.write(&mut open.file, buf)?;
        let size = open.file.fsize;
        if let Some(ni) = st.nodes.get_mut(&ino) {
            ni.size = size;
        }
        drop(state);
        drop(vol);

        file.set_seek_pos(pos + n as i64);
        Ok(n)
    }

    fn ioctl(&self, file: &FileDesc, request: u32, _arg: &mut [u8]) -> Result<(), Errno> {
        match request {
            FAT_IOCTL_CREATE_LINKMAP => {
                let ino = file.vnode().num();
                let mut vol = self.vol.lock();
                let mut state = self.state.lock();
                let open = state.opens.get_mut(&ino).ok_or(Errno::EBADF)?;
                Ok(vol.create_linkmap(&mut open.file)?)
            }
            _ => Err(Errno::ENOTTY),
        }
    }

    fn chmod(&self, vnode: &Arc<Vnode>, mode: Mode) -> Result<(), Errno> {
        let ino = vnode.num();
        let info = self.node_info(ino)?;
        let pos = info.pos.ok_or(Errno::EPERM)?;

        // FAT carries no permission bits; the write bits map onto the
        // read-only attribute.
        let writable = mode.intersects(Mode::IWUSR | Mode::IWGRP | Mode::IWOTH);
        let value = if writable { 0 } else { attr::AM_RDO };
        self.vol.lock().chmod_entry(pos, value, attr::AM_RDO)?;

        let mut state = self.state.lock();
        if let Some(ni) = state.nodes.get_mut(&ino) {
            ni.attr = (ni.attr & !attr::AM_RDO) | value;
        }
        Ok(())
    }

    fn chflags(&self, vnode: &Arc<Vnode>, flags: FileFlags) -> Result<(), Errno> {
        let ino = vnode.num();
        let info = self.node_info(ino)?;
        let pos = info.pos.ok_or(Errno::EPERM)?;

        let mut value = 0u8;
        if flags.contains(FileFlags::UF_HIDDEN) {
            value |= attr::AM_HID;
        }
        if flags.contains(FileFlags::UF_SYSTEM) {
            value |= attr::AM_SYS;
        }
        if flags.contains(FileFlags::SF_ARCHIVED) {
            value |= attr::AM_ARC;
        }
        let mask = attr::AM_HID | attr::AM_SYS | attr::AM_ARC;
        self.vol.lock().chmod_entry(pos, value, mask)?;

        let mut state = self.state.lock();
        if let Some(ni) = state.nodes.get_mut(&ino) {
            ni.attr = (ni.attr & !mask) | value;
        }
        Ok(())
    }

    fn utimes(&self, vnode: &Arc<Vnode>, times: &[Timespec; 2]) -> Result<(), Errno> {
        let ino = vnode.num();
        let info = self.node_info(ino)?;
        let pos = info.pos.ok_or(Errno::EPERM)?;

        let (fdate, ftime) = unix_to_dos(times[1]);
        self.vol.lock().utime_entry(pos, fdate, ftime)?;

        let mut state = self.state.lock();
        if let Some(ni) = state.nodes.get_mut(&ino) {
            ni.fdate = fdate;
            ni.ftime = ftime;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{mkfat, FatKind};
    use core::sync::atomic::{AtomicU32, Ordering};
    use onyx_vfs::{AtFlags, Cred, FsProcess};

    static DISK_SEQ: AtomicU32 = AtomicU32::new(0);

    fn fresh_device(kind: FatKind, nclst: u32) -> alloc::string::String {
        let name = alloc::format!("fat-test-{}", DISK_SEQ.fetch_add(1, Ordering::SeqCst));
        onyx_block::register_device(&name, mkfat(kind, nclst)).unwrap();
        name
    }

    fn setup() -> (FsProcess, Arc<Superblock>) {
        register_driver();
        let dev = fresh_device(FatKind::Fat16, 4100);
        let sb = vfs::mount_root(&dev, "fatfs", MountFlags::empty(), "").unwrap();
        let root = sb.root().unwrap();
        (FsProcess::new(root, Cred::ROOT), sb)
    }

    #[test]
    fn test_open_write_read_through_vfs() {
        let (proc, _sb) = setup();

        let fd = proc
            .open(
                "/HELLO.TXT",
                OpenFlags::RDWR | OpenFlags::CREAT,
                Mode::from_bits_truncate(0o644),
            )
            .unwrap();
        assert_eq!(proc.write(fd, b"hello").unwrap(), 5);
        proc.close(fd).unwrap();

        let fd = proc.open("/HELLO.TXT", OpenFlags::RDONLY, Mode::empty()).unwrap();
        let mut buf = [0u8; 10];
        assert_eq!(proc.read(fd, &mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"hello");
        // A second read is at end of file.
        assert_eq!(proc.read(fd, &mut buf).unwrap(), 0);
        proc.close(fd).unwrap();

        let stat = proc.stat("/HELLO.TXT").unwrap();
        assert_eq!(stat.st_size, 5);
        assert_eq!(stat.st_mode & Mode::IFMT, Mode::IFREG.bits());
    }

    #[test]
    fn test_lookup_same_vnode_by_both_names() {
        let (proc, _sb) = setup();
        let fd = proc
            .open(
                "/My Long Name.txt",
                OpenFlags::RDWR | OpenFlags::CREAT,
                Mode::empty(),
            )
            .unwrap();
        proc.close(fd).unwrap();

        let by_lfn = vfs::namei(&proc, 0, "/My Long Name.txt", AtFlags::empty()).unwrap();
        let by_sfn = vfs::namei(&proc, 0, "/MYLONG~1.TXT", AtFlags::empty()).unwrap();
        assert!(Arc::ptr_eq(&by_lfn, &by_sfn));
        by_lfn.vrele();
        by_sfn.vrele();
    }

    #[test]
    fn test_mkdir_walk_and_dotdot() {
        let (proc, _sb) = setup();
        proc.mkdir("/a", Mode::from_bits_truncate(0o755)).unwrap();
        proc.mkdir("/a/b", Mode::from_bits_truncate(0o755)).unwrap();

        let root = vfs::namei(&proc, 0, "/", AtFlags::empty()).unwrap();
        let up = vfs::namei(&proc, 0, "/a/b/../..", AtFlags::empty()).unwrap();
        assert!(Arc::ptr_eq(&root, &up));
        root.vrele();
        up.vrele();

        // `..` above the process root stays at the root.
        let still_root = vfs::namei(&proc, 0, "/..", AtFlags::empty()).unwrap();
        assert!(Arc::ptr_eq(&still_root, &proc.croot()));
        still_root.vrele();
    }

    #[test]
    fn test_cross_mount_dotdot() {
        let (proc, _sb) = setup();
        proc.mkdir("/mnt", Mode::from_bits_truncate(0o755)).unwrap();

        let target = vfs::namei(&proc, 0, "/mnt", AtFlags::empty()).unwrap();
        let dev2 = fresh_device(FatKind::Fat12, 64);
        let sub_sb = vfs::mount(&target, &dev2, "fatfs", MountFlags::empty(), "").unwrap();

        // Resolving the mount point lands on the mounted root.
        let mnt = vfs::namei(&proc, 0, "/mnt", AtFlags::empty()).unwrap();
        assert!(Arc::ptr_eq(&mnt, &sub_sb.root().unwrap()));

        // `..` inside the mount exits through the base vnode.
        let up = vfs::namei(&proc, 0, "/mnt/..", AtFlags::empty()).unwrap();
        assert!(Arc::ptr_eq(&up, &proc.croot()));
        up.vrele();
        mnt.vrele();

        // Files on the inner volume are reachable through the seam.
        let fd = proc
            .open("/mnt/INNER.TXT", OpenFlags::RDWR | OpenFlags::CREAT, Mode::empty())
            .unwrap();
        proc.write(fd, b"inner").unwrap();
        proc.close(fd).unwrap();

        vfs::umount(&sub_sb).unwrap();
        // After unmount the name no longer resolves.
        assert_eq!(
            vfs::namei(&proc, 0, "/mnt/INNER.TXT", AtFlags::empty()).unwrap_err(),
            Errno::ENOENT
        );
        target.vrele();
    }

    #[test]
    fn test_unlink_while_open_is_busy() {
        let (proc, _sb) = setup();
        let fd = proc
            .open("/F.TXT", OpenFlags::RDWR | OpenFlags::CREAT, Mode::empty())
            .unwrap();
        proc.write(fd, b"x").unwrap();
        proc.close(fd).unwrap();

        let fd = proc.open("/F.TXT", OpenFlags::RDONLY, Mode::empty()).unwrap();
        assert_eq!(proc.unlink("/F.TXT").unwrap_err(), Errno::EBUSY);
        proc.close(fd).unwrap();
        proc.unlink("/F.TXT").unwrap();
        assert_eq!(
            proc.open("/F.TXT", OpenFlags::RDONLY, Mode::empty())
                .unwrap_err(),
            Errno::ENOENT
        );
    }

    #[test]
    fn test_exclusive_create() {
        let (proc, _sb) = setup();
        let fd = proc
            .open(
                "/X.TXT",
                OpenFlags::RDWR | OpenFlags::CREAT | OpenFlags::EXCL,
                Mode::empty(),
            )
            .unwrap();
        proc.close(fd).unwrap();
        assert_eq!(
            proc.open(
                "/X.TXT",
                OpenFlags::RDWR | OpenFlags::CREAT | OpenFlags::EXCL,
                Mode::empty(),
            )
            .unwrap_err(),
            Errno::EEXIST
        );
    }

    #[test]
    fn test_readdir_through_fd() {
        let (proc, _sb) = setup();
        for name in ["/ONE.TXT", "/TWO.TXT"] {
            let fd = proc
                .open(name, OpenFlags::RDWR | OpenFlags::CREAT, Mode::empty())
                .unwrap();
            proc.close(fd).unwrap();
        }
        proc.mkdir("/SUB", Mode::from_bits_truncate(0o755)).unwrap();

        let fd = proc
            .open("/", OpenFlags::RDONLY | OpenFlags::DIRECTORY, Mode::empty())
            .unwrap();
        let mut names = alloc::vec::Vec::new();
        while let Some(d) = proc.readdir(fd).unwrap() {
            names.push(d.d_name);
        }
        proc.close(fd).unwrap();
        assert_eq!(names, ["ONE.TXT", "TWO.TXT", "SUB"]);
    }

    #[test]
    fn test_trailing_slash_forces_directory() {
        let (proc, _sb) = setup();
        let fd = proc
            .open("/PLAIN.TXT", OpenFlags::RDWR | OpenFlags::CREAT, Mode::empty())
            .unwrap();
        proc.close(fd).unwrap();

        assert_eq!(
            vfs::namei(&proc, 0, "/PLAIN.TXT/", AtFlags::empty()).unwrap_err(),
            Errno::ENOTDIR
        );
    }

    #[test]
    fn test_chmod_readonly_blocks_write_open() {
        let (proc, _sb) = setup();
        let fd = proc
            .open("/RO.TXT", OpenFlags::RDWR | OpenFlags::CREAT, Mode::empty())
            .unwrap();
        proc.chmod(fd, Mode::from_bits_truncate(0o444)).unwrap();
        proc.close(fd).unwrap();

        let stat = proc.stat("/RO.TXT").unwrap();
        assert_eq!(stat.st_mode & 0o777, 0o444);

        // The engine refuses write opens on a read-only entry.
        assert_eq!(
            proc.open("/RO.TXT", OpenFlags::RDWR, Mode::empty())
                .unwrap_err(),
            Errno::EACCES
        );

        // And a non-root caller fails the permission check first.
        let user = FsProcess::new(proc.croot(), Cred { euid: 1000, egid: 1000 });
        assert_eq!(
            user.open("/RO.TXT", OpenFlags::RDWR, Mode::empty())
                .unwrap_err(),
            Errno::EPERM
        );
        let fd = user.open("/RO.TXT", OpenFlags::RDONLY, Mode::empty()).unwrap();
        user.close(fd).unwrap();
    }

    #[test]
    fn test_rename_through_fs_handle() {
        let (proc, sb) = setup();
        let fd = proc
            .open("/OLD.TXT", OpenFlags::RDWR | OpenFlags::CREAT, Mode::empty())
            .unwrap();
        proc.write(fd, b"payload").unwrap();
        proc.close(fd).unwrap();
        proc.mkdir("/DIR", Mode::from_bits_truncate(0o755)).unwrap();

        let root = sb.root().unwrap();
        let dir = vfs::namei(&proc, 0, "/DIR", AtFlags::empty()).unwrap();
        let fatfs = FatFs::from_superblock(&sb).expect("mounted instance");
        fatfs.rename(&root, "OLD.TXT", &dir, "NEW.TXT").unwrap();
        dir.vrele();

        assert_eq!(
            proc.stat("/OLD.TXT").unwrap_err(),
            Errno::ENOENT
        );
        let stat = proc.stat("/DIR/NEW.TXT").unwrap();
        assert_eq!(stat.st_size, 7);
    }

    #[test]
    fn test_append_mode() {
        let (proc, _sb) = setup();
        let fd = proc
            .open("/LOG.TXT", OpenFlags::RDWR | OpenFlags::CREAT, Mode::empty())
            .unwrap();
        proc.write(fd, b"one").unwrap();
        proc.close(fd).unwrap();

        let fd = proc
            .open("/LOG.TXT", OpenFlags::WRONLY | OpenFlags::APPEND, Mode::empty())
            .unwrap();
        proc.write(fd, b"two").unwrap();
        proc.close(fd).unwrap();

        let fd = proc.open("/LOG.TXT", OpenFlags::RDONLY, Mode::empty()).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(proc.read(fd, &mut buf).unwrap(), 6);
        assert_eq!(&buf[..6], b"onetwo");
        proc.close(fd).unwrap();
    }

    #[test]
    fn test_truncate_on_open() {
        let (proc, _sb) = setup();
        let fd = proc
            .open("/T.TXT", OpenFlags::RDWR | OpenFlags::CREAT, Mode::empty())
            .unwrap();
        proc.write(fd, b"0123456789").unwrap();
        proc.close(fd).unwrap();

        let fd = proc
            .open("/T.TXT", OpenFlags::RDWR | OpenFlags::TRUNC, Mode::empty())
            .unwrap();
        proc.close(fd).unwrap();
        assert_eq!(proc.stat("/T.TXT").unwrap().st_size, 0);
    }

    #[test]
    fn test_linkmap_ioctl() {
        let (proc, _sb) = setup();
        let fd = proc
            .open("/MAP.BIN", OpenFlags::RDWR | OpenFlags::CREAT, Mode::empty())
            .unwrap();
        proc.write(fd, &[9u8; 2048]).unwrap();
        proc.ioctl(fd, FAT_IOCTL_CREATE_LINKMAP, &mut []).unwrap();
        // An unknown request is rejected.
        assert_eq!(proc.ioctl(fd, 0xDEAD, &mut []).unwrap_err(), Errno::ENOTTY);
        proc.close(fd).unwrap();
    }

    #[test]
    fn test_label_and_free_count() {
        let (_proc, sb) = setup();
        let fatfs = FatFs::from_superblock(&sb).expect("mounted instance");
        let (label, vsn) = fatfs.getlabel().unwrap();
        assert_eq!(label, "");
        assert_eq!(vsn, 0x1234_5678);
        assert!(fatfs.getfree().unwrap() > 0);
    }
}
