//! # Filesystem Registry and Mounts
//!
//! Filesystem drivers register themselves by name; `mount` resolves the
//! driver, asks it for a superblock, and splices the new root on top of the
//! target vnode's mount stack. `umount` reverses the splice and refuses to
//! take down the initial root.

use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;
use log::debug;
use spin::Mutex;

use crate::error::Errno;
use crate::vnode::Vnode;

bitflags! {
    /// Mount flag word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MountFlags: u32 {
        /// Mount the filesystem read-only.
        const RDONLY = 0x0001;
    }
}

/// Driver-supplied superblock operations: vnode destruction and unmount.
pub trait SuperblockOps: Send + Sync {
    /// Destroys a vnode whose reference count reached zero. The vnode's
    /// storage belongs to the filesystem, so only the driver may free it.
    fn delete_vnode(&self, vnode: &Arc<Vnode>);

    /// Tears the filesystem instance down after it has been unspliced.
    fn umount(&self) -> Result<(), Errno>;
}

/// Per-mount record tying a filesystem instance to the mount tree.
pub struct Superblock {
    fsname: &'static str,
    vdev_id: u64,
    root: Mutex<Option<Arc<Vnode>>>,
    mountpoint: Mutex<Option<Arc<Vnode>>>,
    ops: Arc<dyn SuperblockOps>,
}

impl core::fmt::Debug for Superblock {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Superblock")
            .field("fsname", &self.fsname)
            .field("vdev_id", &self.vdev_id)
            .field("root", &self.root)
            .field("mountpoint", &self.mountpoint)
            .finish()
    }
}

impl Superblock {
    /// Creates a superblock without a root; the driver installs the root
    /// vnode once it exists (the vnode needs a back-pointer to the
    /// superblock, so the superblock is built first).
    pub fn new(fsname: &'static str, vdev_id: u64, ops: Arc<dyn SuperblockOps>) -> Arc<Superblock> {
        Arc::new(Superblock {
            fsname,
            vdev_id,
            root: Mutex::new(None),
            mountpoint: Mutex::new(None),
            ops,
        })
    }

    /// Name of the owning filesystem driver.
    pub fn fsname(&self) -> &'static str {
        self.fsname
    }

    /// Identifier of the backing device; used for cross-device checks.
    pub fn vdev_id(&self) -> u64 {
        self.vdev_id
    }

    /// Installs the root vnode. Called once by the driver during mount.
    pub fn set_root(&self, root: Arc<Vnode>) {
        *self.root.lock() = Some(root);
    }

    /// Root vnode of this filesystem instance.
    pub fn root(&self) -> Option<Arc<Vnode>> {
        self.root.lock().clone()
    }

    /// The vnode this filesystem is mounted on, if any.
    pub fn mountpoint(&self) -> Option<Arc<Vnode>> {
        self.mountpoint.lock().clone()
    }

    /// Superblock operations of the owning driver.
    pub fn ops(&self) -> &Arc<dyn SuperblockOps> {
        &self.ops
    }
}

/// A named, mountable filesystem driver.
pub trait FsDriver: Send + Sync {
    /// Driver name used by `mount`.
    fn name(&self) -> &'static str;

    /// Mounts an instance and returns a superblock with a populated root.
    fn mount(
        &self,
        source: &str,
        flags: MountFlags,
        parm: &str,
    ) -> Result<Arc<Superblock>, Errno>;
}

/// Registered filesystem drivers, newest first. Lookups scan from the
/// front, so the last registered driver wins on name ties.
static FS_REGISTRY: Mutex<Vec<Arc<dyn FsDriver>>> = Mutex::new(Vec::new());

/// Registers a filesystem driver. Duplicate names are not rejected.
pub fn register(fs: Arc<dyn FsDriver>) {
    debug!("fs register: {}", fs.name());
    FS_REGISTRY.lock().insert(0, fs);
}

/// Finds a driver by name.
pub fn by_name(fsname: &str) -> Option<Arc<dyn FsDriver>> {
    FS_REGISTRY
        .lock()
        .iter()
        .find(|fs| fs.name() == fsname)
        .cloned()
}

/// Yields the registered driver at `index`, front (newest) first.
pub fn iterate(index: usize) -> Option<Arc<dyn FsDriver>> {
    FS_REGISTRY.lock().get(index).cloned()
}

/// Mounts `fsname` from `source` on top of `target`.
///
/// The new root is spliced above the current top of the target's mount
/// stack. Returns the superblock so the caller can keep the mount alive
/// and later unmount it.
pub fn mount(
    target: &Arc<Vnode>,
    source: &str,
    fsname: &str,
    flags: MountFlags,
    parm: &str,
) -> Result<Arc<Superblock>, Errno> {
    let fs = by_name(fsname).ok_or(Errno::ENOTSUP)?;

    let sb = fs.mount(source, flags, parm)?;
    let root = sb.root().ok_or(Errno::EINVAL)?;

    let target = Vnode::top_of(target);
    *sb.mountpoint.lock() = Some(target.clone());
    Vnode::splice_mount(&target, &root);

    debug!("mounted {} from {} ", fsname, source);
    Ok(sb)
}

/// Mounts the initial root filesystem. No target splice: the returned
/// superblock's root is the base of the whole tree, self-linked on `prev`.
pub fn mount_root(
    source: &str,
    fsname: &str,
    flags: MountFlags,
    parm: &str,
) -> Result<Arc<Superblock>, Errno> {
    let fs = by_name(fsname).ok_or(Errno::ENOTSUP)?;
    let sb = fs.mount(source, flags, parm)?;
    sb.root().ok_or(Errno::EINVAL)?;
    debug!("mounted root fs {} from {}", fsname, source);
    Ok(sb)
}

/// Unmounts a filesystem instance by reversing the mount splice.
///
/// Refuses the initial root: a root vnode whose `prev` link is itself was
/// never mounted on anything.
pub fn umount(sb: &Arc<Superblock>) -> Result<(), Errno> {
    let root = sb.root().ok_or(Errno::EINVAL)?;
    Vnode::unsplice_mount(&root)?;
    *sb.mountpoint.lock() = None;
    sb.ops.umount()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vnode::{Mode, VnodeOps};
    use alloc::sync::Weak;

    struct StubOps;
    impl VnodeOps for StubOps {}

    struct StubFs;
    impl SuperblockOps for StubFs {
        fn delete_vnode(&self, _vnode: &Arc<Vnode>) {}
        fn umount(&self) -> Result<(), Errno> {
            Ok(())
        }
    }
    impl FsDriver for StubFs {
        fn name(&self) -> &'static str {
            "stubfs"
        }
        fn mount(
            &self,
            _source: &str,
            _flags: MountFlags,
            _parm: &str,
        ) -> Result<Arc<Superblock>, Errno> {
            let sb = Superblock::new("stubfs", 0, Arc::new(StubFs));
            let root = Vnode::new(
                1,
                Mode::IFDIR | Mode::IRUSR | Mode::IXUSR,
                Arc::new(StubOps),
                Arc::downgrade(&sb),
            );
            root.refset(1);
            sb.set_root(root);
            Ok(sb)
        }
    }

    #[test]
    fn test_register_and_lookup() {
        register(Arc::new(StubFs));
        assert!(by_name("stubfs").is_some());
        assert!(by_name("nosuchfs").is_none());
        assert!(iterate(0).is_some());
    }

    #[test]
    fn test_mount_umount_restores_target() {
        register(Arc::new(StubFs));
        let root_sb = mount_root("none", "stubfs", MountFlags::empty(), "").unwrap();
        let root = root_sb.root().unwrap();

        let target = Vnode::new(
            42,
            Mode::IFDIR | Mode::IRUSR,
            Arc::new(StubOps),
            Arc::downgrade(&root_sb),
        );
        let sb = mount(&target, "none", "stubfs", MountFlags::empty(), "").unwrap();
        assert!(target.is_mountpoint());
        assert!(Arc::ptr_eq(&sb.mountpoint().unwrap(), &target));

        umount(&sb).unwrap();
        assert!(!target.is_mountpoint());
        let mounted_root = sb.root().unwrap();
        assert!(mounted_root.is_mount_base());
        assert!(!mounted_root.is_mountpoint());

        // The initial root refuses to unmount.
        assert_eq!(umount(&root_sb).unwrap_err(), Errno::EINVAL);
        let _ = root;
    }

    #[test]
    fn test_unknown_fs() {
        let target = Vnode::new(1, Mode::IFDIR, Arc::new(StubOps), Weak::new());
        assert_eq!(
            mount(&target, "none", "nosuchfs", MountFlags::empty(), "").unwrap_err(),
            Errno::ENOTSUP
        );
    }
}
