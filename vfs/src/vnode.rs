//! # Vnodes
//!
//! The in-memory handle for a filesystem object. Vnodes are shared,
//! reference counted, and destroyed by the filesystem driver that produced
//! them; generic code never frees a vnode directly.
//!
//! Each vnode also carries the two mount-stack neighbours for its location:
//! `prev` points at the mount point covered underneath, `next` at the root
//! mounted on top. Both are self-links when nothing is stacked here.

use alloc::string::String;
use alloc::sync::{Arc, Weak};
use core::sync::atomic::{AtomicI32, Ordering};
use spin::Mutex;

use bitflags::bitflags;

use crate::error::Errno;
use crate::file::{FileDesc, OpenFlags};
use crate::mount::Superblock;

/// Vnode / inode number within a filesystem.
pub type VnodeNum = u64;

bitflags! {
    /// File mode word: file type plus permission bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Mode: u32 {
        const IFREG = 0o100000;
        const IFDIR = 0o040000;
        const IFCHR = 0o020000;
        const IFBLK = 0o060000;
        const IFLNK = 0o120000;

        const IRUSR = 0o400;
        const IWUSR = 0o200;
        const IXUSR = 0o100;
        const IRGRP = 0o040;
        const IWGRP = 0o020;
        const IXGRP = 0o010;
        const IROTH = 0o004;
        const IWOTH = 0o002;
        const IXOTH = 0o001;
    }
}

impl Mode {
    /// Mask covering the file type bits.
    pub const IFMT: u32 = 0o170000;

    /// Returns the file type bits only.
    pub fn file_type(self) -> u32 {
        self.bits() & Self::IFMT
    }

    /// True if the mode describes a directory.
    pub fn is_dir(self) -> bool {
        self.file_type() == Self::IFDIR.bits()
    }

    /// True if the mode describes a regular file.
    pub fn is_reg(self) -> bool {
        self.file_type() == Self::IFREG.bits()
    }

    /// Strips the file type bits, keeping permissions.
    pub fn perm_bits(self) -> Mode {
        Mode::from_bits_truncate(self.bits() & !Self::IFMT)
    }
}

bitflags! {
    /// File flags changed with `chflags`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FileFlags: u32 {
        /// File should not be displayed
        const UF_HIDDEN = 0x0000_8000;
        /// File belongs to the system
        const UF_SYSTEM = 0x0000_0080;
        /// File has been archived
        const SF_ARCHIVED = 0x0001_0000;
    }
}

/// A point in time, seconds and nanoseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timespec {
    pub tv_sec: i64,
    pub tv_nsec: i64,
}

/// File status returned by the `stat` operation.
#[derive(Debug, Clone, Copy, Default)]
pub struct Stat {
    pub st_dev: u64,
    pub st_ino: VnodeNum,
    pub st_mode: u32,
    pub st_nlink: u32,
    pub st_uid: u32,
    pub st_gid: u32,
    pub st_size: i64,
    pub st_blksize: u32,
    pub st_blocks: u64,
    pub st_atim: Timespec,
    pub st_mtim: Timespec,
    pub st_ctim: Timespec,
    pub st_flags: u32,
}

/// A directory entry produced by `readdir`.
#[derive(Debug, Clone)]
pub struct Dirent {
    pub d_ino: VnodeNum,
    /// File type bits of the entry (`Mode::IFMT` domain).
    pub d_type: u32,
    pub d_name: String,
}

/// Mount-stack neighbours of a vnode. Self-links mean nothing is stacked.
#[derive(Debug)]
struct MountLinks {
    prev: Weak<Vnode>,
    next: Weak<Vnode>,
}

/// The VFS handle for a filesystem object.
pub struct Vnode {
    num: VnodeNum,
    mode: Mode,
    refcount: AtomicI32,
    sb: Weak<Superblock>,
    ops: Arc<dyn VnodeOps>,
    links: Mutex<MountLinks>,
    self_ref: Weak<Vnode>,
}

impl core::fmt::Debug for Vnode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Vnode")
            .field("num", &self.num)
            .field("mode", &self.mode)
            .field("refcount", &self.refcount)
            .field("links", &self.links)
            .finish()
    }
}

impl Vnode {
    /// Creates a new vnode with a zero reference count and self-linked
    /// mount neighbours. The producing filesystem takes the first
    /// reference explicitly.
    pub fn new(
        num: VnodeNum,
        mode: Mode,
        ops: Arc<dyn VnodeOps>,
        sb: Weak<Superblock>,
    ) -> Arc<Vnode> {
        Arc::new_cyclic(|me| Vnode {
            num,
            mode,
            refcount: AtomicI32::new(0),
            sb,
            ops,
            links: Mutex::new(MountLinks {
                prev: me.clone(),
                next: me.clone(),
            }),
            self_ref: me.clone(),
        })
    }

    /// Vnode number within its filesystem.
    pub fn num(&self) -> VnodeNum {
        self.num
    }

    /// File mode.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// The operations table of the owning filesystem.
    pub fn ops(&self) -> &Arc<dyn VnodeOps> {
        &self.ops
    }

    /// The superblock this vnode belongs to.
    pub fn superblock(&self) -> Option<Arc<Superblock>> {
        self.sb.upgrade()
    }

    /// Current reference count.
    pub fn refcnt(&self) -> i32 {
        self.refcount.load(Ordering::SeqCst)
    }

    /// Forces the reference count to a known value.
    pub fn refset(&self, refcnt: i32) {
        self.refcount.store(refcnt, Ordering::SeqCst);
    }

    /// Takes a reference. Refuses to resurrect a vnode already on its way
    /// to destruction.
    pub fn vref(self: &Arc<Self>) -> Result<(), Errno> {
        if self.refcount.load(Ordering::SeqCst) < 0 {
            return Err(Errno::ENOLINK);
        }
        self.refcount.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Drops a reference. The transition to zero hands the vnode back to
    /// its filesystem for destruction.
    pub fn vrele(self: &Arc<Self>) {
        let prev = self.refcount.fetch_sub(1, Ordering::SeqCst);
        if prev <= 1 {
            if let Some(sb) = self.sb.upgrade() {
                sb.ops().delete_vnode(self);
            }
        }
    }

    /// Drops a reference without triggering destruction. Used when the
    /// filesystem itself still tracks the vnode.
    pub fn vrele_nunlink(self: &Arc<Self>) {
        self.refcount.fetch_sub(1, Ordering::SeqCst);
    }

    fn is_self(&self, other: &Weak<Vnode>) -> bool {
        Weak::ptr_eq(other, &self.self_ref)
    }

    /// True if this vnode is the base of its location, i.e. nothing is
    /// mounted underneath. The root of the initial mount is the unique
    /// vnode for which this holds while also being a filesystem root.
    pub fn is_mount_base(&self) -> bool {
        let links = self.links.lock();
        self.is_self(&links.prev)
    }

    /// True if a filesystem root is stacked on top of this vnode.
    pub fn is_mountpoint(&self) -> bool {
        let links = self.links.lock();
        !self.is_self(&links.next)
    }

    /// Walks to the top-most root mounted at this location.
    pub fn top_of(vn: &Arc<Vnode>) -> Arc<Vnode> {
        let mut cur = vn.clone();
        loop {
            let next = {
                let links = cur.links.lock();
                let is_self = cur.is_self(&links.next);
                let upgraded = links.next.upgrade();
                (is_self, upgraded)
            };
            if next.0 {
                return cur;
            }
            let next = next.1;
            match next {
                Some(n) => cur = n,
                None => return cur,
            }
        }
    }

    /// Walks to the base mount-point vnode underneath this location.
    pub fn base_of(vn: &Arc<Vnode>) -> Arc<Vnode> {
        let mut cur = vn.clone();
        loop {
            let prev = {
                let links = cur.links.lock();
                let is_self = cur.is_self(&links.prev);
                let upgraded = links.prev.upgrade();
                (is_self, upgraded)
            };
            if prev.0 {
                return cur;
            }
            let prev = prev.1;
            match prev {
                Some(p) => cur = p,
                None => return cur,
            }
        }
    }

    /// Splices `root` on top of `target`. Callers must be the mount path;
    /// both vnodes' link locks are taken in a fixed order.
    pub(crate) fn splice_mount(target: &Arc<Vnode>, root: &Arc<Vnode>) {
        let mut root_links = root.links.lock();
        let mut target_links = target.links.lock();
        target_links.next = Arc::downgrade(root);
        root_links.prev = Arc::downgrade(target);
        root_links.next = root.self_ref.clone();
    }

    /// Reverses [`Vnode::splice_mount`]. Returns the base vnode the mount
    /// was stacked on, or `Err` if this root is the initial mount root.
    pub(crate) fn unsplice_mount(root: &Arc<Vnode>) -> Result<Arc<Vnode>, Errno> {
        let (prev, next) = {
            let links = root.links.lock();
            if root.is_self(&links.prev) {
                return Err(Errno::EINVAL);
            }
            (links.prev.upgrade(), links.next.upgrade())
        };
        let prev = prev.ok_or(Errno::EINVAL)?;

        let mut root_links = root.links.lock();
        let mut prev_links = prev.links.lock();
        match next {
            Some(ref n) if !Arc::ptr_eq(n, root) => {
                let mut next_links = n.links.lock();
                prev_links.next = root_links.next.clone();
                next_links.prev = Arc::downgrade(&prev);
            }
            _ => {
                prev_links.next = prev.self_ref.clone();
            }
        }
        root_links.next = root.self_ref.clone();
        root_links.prev = root.self_ref.clone();
        drop(prev_links);
        drop(root_links);

        Ok(prev)
    }
}

/// The operation table every filesystem implements for its vnodes.
///
/// Default bodies implement the "not supported" filesystem so a driver
/// only fills in what it actually provides.
pub trait VnodeOps: Send + Sync {
    /// Advisory file locking.
    fn lock(&self, _file: &FileDesc) -> Result<(), Errno> {
        Err(Errno::ENOTSUP)
    }

    /// Release an advisory lock.
    fn release(&self, _file: &FileDesc) -> Result<(), Errno> {
        Err(Errno::ENOTSUP)
    }

    /// Read from the object at the descriptor's seek position.
    fn read(&self, _file: &FileDesc, _buf: &mut [u8]) -> Result<usize, Errno> {
        Err(Errno::ENOTSUP)
    }

    /// Write to the object at the descriptor's seek position.
    fn write(&self, _file: &FileDesc, _buf: &[u8]) -> Result<usize, Errno> {
        Err(Errno::ENOTSUP)
    }

    /// Device- or filesystem-specific control operation.
    fn ioctl(&self, _file: &FileDesc, _request: u32, _arg: &mut [u8]) -> Result<(), Errno> {
        Err(Errno::ENOTTY)
    }

    /// Called when a descriptor is opened on the vnode.
    fn file_opened(&self, _vnode: &Arc<Vnode>, _oflags: OpenFlags) -> Result<(), Errno> {
        Ok(())
    }

    /// Called when the last reference of a descriptor is closed.
    fn file_closed(&self, _file: &FileDesc) {}

    /// Create a regular file in `dir`.
    fn create(&self, _dir: &Arc<Vnode>, _name: &str, _mode: Mode) -> Result<Arc<Vnode>, Errno> {
        Err(Errno::ENOTSUP)
    }

    /// Create a special file in `dir`.
    fn mknod(&self, _dir: &Arc<Vnode>, _name: &str, _mode: Mode) -> Result<Arc<Vnode>, Errno> {
        Err(Errno::ENOTSUP)
    }

    /// Look up `name` in the directory `dir` and return a referenced child.
    ///
    /// A driver returns `Err(Errno::EDOM)` when `name` is `..` and `dir` is
    /// the root of its own filesystem; the resolver then exits the mount
    /// through the base vnode underneath.
    fn lookup(&self, _dir: &Arc<Vnode>, _name: &str) -> Result<Arc<Vnode>, Errno> {
        Err(Errno::ENOTSUP)
    }

    /// Create a hard link to `vnode` under `dir`.
    fn link(&self, _dir: &Arc<Vnode>, _vnode: &Arc<Vnode>, _name: &str) -> Result<(), Errno> {
        Err(Errno::EACCES)
    }

    /// Remove the entry `name` from `dir`.
    fn unlink(&self, _dir: &Arc<Vnode>, _name: &str) -> Result<(), Errno> {
        Err(Errno::EACCES)
    }

    /// Create a directory.
    fn mkdir(&self, _dir: &Arc<Vnode>, _name: &str, _mode: Mode) -> Result<(), Errno> {
        Err(Errno::ENOTSUP)
    }

    /// Remove an empty directory.
    fn rmdir(&self, _dir: &Arc<Vnode>, _name: &str) -> Result<(), Errno> {
        Err(Errno::ENOTSUP)
    }

    /// Read the next directory entry at `*off`, advancing it.
    /// `Ok(None)` is end of directory.
    fn readdir(&self, _dir: &Arc<Vnode>, _off: &mut u64) -> Result<Option<Dirent>, Errno> {
        Err(Errno::ENOTSUP)
    }

    /// File status.
    fn stat(&self, _vnode: &Arc<Vnode>) -> Result<Stat, Errno> {
        Err(Errno::ENOTSUP)
    }

    /// Change access and modification times.
    fn utimes(&self, _vnode: &Arc<Vnode>, _times: &[Timespec; 2]) -> Result<(), Errno> {
        Err(Errno::EPERM)
    }

    /// Change permission bits.
    fn chmod(&self, _vnode: &Arc<Vnode>, _mode: Mode) -> Result<(), Errno> {
        Err(Errno::ENOTSUP)
    }

    /// Change file flags.
    fn chflags(&self, _vnode: &Arc<Vnode>, _flags: FileFlags) -> Result<(), Errno> {
        Err(Errno::ENOTSUP)
    }

    /// Change owner and group.
    fn chown(&self, _vnode: &Arc<Vnode>, _uid: u32, _gid: u32) -> Result<(), Errno> {
        Err(Errno::ENOTSUP)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mount::{Superblock, SuperblockOps};
    use alloc::vec::Vec;

    struct StubOps;
    impl VnodeOps for StubOps {}

    struct StubSb {
        deleted: Mutex<Vec<VnodeNum>>,
    }
    impl SuperblockOps for StubSb {
        fn delete_vnode(&self, vnode: &Arc<Vnode>) {
            self.deleted.lock().push(vnode.num());
        }
        fn umount(&self) -> Result<(), Errno> {
            Ok(())
        }
    }

    fn stub_sb() -> (Arc<Superblock>, Arc<StubSb>) {
        let ops = Arc::new(StubSb {
            deleted: Mutex::new(Vec::new()),
        });
        let sb = Superblock::new("stubfs", 0, ops.clone());
        (sb, ops)
    }

    fn stub_vnode(sb: &Arc<Superblock>, num: VnodeNum) -> Arc<Vnode> {
        Vnode::new(num, Mode::IFDIR | Mode::IRUSR, Arc::new(StubOps), Arc::downgrade(sb))
    }

    #[test]
    fn test_new_vnode_is_self_linked() {
        let (sb, _) = stub_sb();
        let vn = stub_vnode(&sb, 1);
        assert!(vn.is_mount_base());
        assert!(!vn.is_mountpoint());
        assert!(Arc::ptr_eq(&Vnode::top_of(&vn), &vn));
        assert!(Arc::ptr_eq(&Vnode::base_of(&vn), &vn));
    }

    #[test]
    fn test_refcount_delete_on_zero() {
        let (sb, ops) = stub_sb();
        let vn = stub_vnode(&sb, 7);
        vn.refset(1);
        vn.vref().unwrap();
        assert_eq!(vn.refcnt(), 2);
        vn.vrele();
        assert!(ops.deleted.lock().is_empty());
        vn.vrele();
        assert_eq!(&*ops.deleted.lock(), &[7]);
    }

    #[test]
    fn test_vref_refuses_negative() {
        let (sb, _) = stub_sb();
        let vn = stub_vnode(&sb, 2);
        vn.refset(-1);
        assert_eq!(vn.vref(), Err(Errno::ENOLINK));
    }

    #[test]
    fn test_splice_and_unsplice() {
        let (sb, _) = stub_sb();
        let target = stub_vnode(&sb, 1);
        let root = stub_vnode(&sb, 2);

        Vnode::splice_mount(&target, &root);
        assert!(target.is_mountpoint());
        assert!(!root.is_mount_base());
        assert!(Arc::ptr_eq(&Vnode::top_of(&target), &root));
        assert!(Arc::ptr_eq(&Vnode::base_of(&root), &target));

        let base = Vnode::unsplice_mount(&root).unwrap();
        assert!(Arc::ptr_eq(&base, &target));
        assert!(!target.is_mountpoint());
        assert!(root.is_mount_base());
        // A second unsplice must refuse: the root is now self-linked.
        assert_eq!(Vnode::unsplice_mount(&root).unwrap_err(), Errno::EINVAL);
    }

    #[test]
    fn test_mount_stack_of_two() {
        let (sb, _) = stub_sb();
        let target = stub_vnode(&sb, 1);
        let root1 = stub_vnode(&sb, 2);
        let root2 = stub_vnode(&sb, 3);

        Vnode::splice_mount(&target, &root1);
        Vnode::splice_mount(&Vnode::top_of(&target), &root2);

        assert!(Arc::ptr_eq(&Vnode::top_of(&target), &root2));
        assert!(Arc::ptr_eq(&Vnode::base_of(&root2), &target));

        // Unmounting the middle splices target straight to root2.
        let base = Vnode::unsplice_mount(&root1).unwrap();
        assert!(Arc::ptr_eq(&base, &target));
        assert!(Arc::ptr_eq(&Vnode::top_of(&target), &root2));
        assert!(Arc::ptr_eq(&Vnode::base_of(&root2), &target));
    }
}
