//! # File Descriptors
//!
//! The per-process open-file table: an ordered array of slots, each holding
//! a reference-counted descriptor record. Releasing the last reference
//! drops the vnode reference and clears the slot.

use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::sync::atomic::{AtomicI32, AtomicI64, Ordering};
use spin::Mutex;

use crate::error::Errno;
use crate::vnode::{Mode, Vnode};

bitflags! {
    /// Open flags. Unlike the POSIX encoding, the read bit is explicit so
    /// access checks are plain bit tests.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        /// Open for reading
        const RDONLY = 0x0001;
        /// Open for writing
        const WRONLY = 0x0002;
        /// Open for reading and writing
        const RDWR = 0x0003;
        /// Create the file if it does not exist
        const CREAT = 0x0010;
        /// With CREAT, fail if the file exists
        const EXCL = 0x0020;
        /// Truncate to zero length on open
        const TRUNC = 0x0040;
        /// All writes append
        const APPEND = 0x0080;
        /// Fail unless the path names a directory
        const DIRECTORY = 0x0100;
        /// Do not follow a trailing symbolic link.
        /// Accepted and currently ignored; symlinks are reserved.
        const NOFOLLOW = 0x0200;
    }
}

bitflags! {
    /// Per-descriptor state flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FdFlags: u32 {
        /// Record is heap owned and is released with its last reference.
        const FREEABLE = 0x0001;
        /// Close the descriptor on exec.
        const CLOEXEC = 0x0002;
    }
}

/// An open file description.
pub struct FileDesc {
    vnode: Arc<Vnode>,
    oflags: OpenFlags,
    seek_pos: AtomicI64,
    refcount: AtomicI32,
    fdflags: FdFlags,
}

impl FileDesc {
    /// Builds a descriptor holding one reference (the opener's).
    /// The caller must already hold a vnode reference to hand over.
    pub fn new(vnode: Arc<Vnode>, oflags: OpenFlags) -> Arc<FileDesc> {
        Arc::new(FileDesc {
            vnode,
            oflags,
            seek_pos: AtomicI64::new(0),
            refcount: AtomicI32::new(1),
            fdflags: FdFlags::FREEABLE,
        })
    }

    /// The vnode this descriptor refers to.
    pub fn vnode(&self) -> &Arc<Vnode> {
        &self.vnode
    }

    /// Open flags of the descriptor.
    pub fn oflags(&self) -> OpenFlags {
        self.oflags
    }

    /// Current seek position.
    pub fn seek_pos(&self) -> i64 {
        self.seek_pos.load(Ordering::SeqCst)
    }

    /// Moves the seek position.
    pub fn set_seek_pos(&self, pos: i64) {
        self.seek_pos.store(pos, Ordering::SeqCst);
    }

    /// Descriptor flags.
    pub fn fdflags(&self) -> FdFlags {
        self.fdflags
    }
}

/// A process open-file table of fixed capacity plus the file creation mask.
pub struct Files {
    fds: Mutex<Vec<Option<Arc<FileDesc>>>>,
    umask: Mutex<Mode>,
}

impl Files {
    /// Creates a table with `count` descriptor slots.
    pub fn new(count: usize) -> Files {
        let mut fds = Vec::with_capacity(count);
        fds.resize_with(count, || None);
        Files {
            fds: Mutex::new(fds),
            umask: Mutex::new(Mode::IWGRP | Mode::IWOTH),
        }
    }

    /// Number of descriptor slots.
    pub fn count(&self) -> usize {
        self.fds.lock().len()
    }

    /// The file creation mask.
    pub fn umask(&self) -> Mode {
        *self.umask.lock()
    }

    /// Replaces the file creation mask, returning the old one.
    pub fn set_umask(&self, mask: Mode) -> Mode {
        core::mem::replace(&mut *self.umask.lock(), mask.perm_bits())
    }

    /// Installs `file` in the first free slot at or after `start`.
    pub fn fildes_next(&self, file: Arc<FileDesc>, start: usize) -> Result<usize, Errno> {
        let mut fds = self.fds.lock();
        if start > fds.len().saturating_sub(1) {
            return Err(Errno::EMFILE);
        }
        for (i, slot) in fds.iter_mut().enumerate().skip(start) {
            if slot.is_none() {
                *slot = Some(file);
                return Ok(i);
            }
        }
        Err(Errno::ENFILE)
    }

    /// Adjusts the reference count of descriptor `fd` by `count` and
    /// returns the record, or `None` if the slot is empty or the record
    /// was released.
    ///
    /// When the count drops to zero or below, the vnode reference is
    /// dropped, the record is freed with its last `Arc`, and the slot is
    /// cleared.
    pub fn fildes_ref(&self, fd: usize, count: i32) -> Option<Arc<FileDesc>> {
        let mut fds = self.fds.lock();
        let file = fds.get(fd)?.clone()?;

        let old = file.refcount.fetch_add(count, Ordering::SeqCst);
        if old + count <= 0 {
            file.vnode.vrele();
            fds[fd] = None;
            return None;
        }

        Some(file)
    }

    /// Closes descriptor `fd`: notifies the driver, then drops the open
    /// reference together with the one taken for the call.
    pub fn close(&self, fd: usize) -> Result<(), Errno> {
        let file = self.fildes_ref(fd, 1).ok_or(Errno::EBADF)?;
        file.vnode.ops().file_closed(&file);
        self.fildes_ref(fd, -2);
        self.fds.lock()[fd] = None;
        Ok(())
    }

    /// Reads from descriptor `fd` at its seek position.
    pub fn read(&self, fd: usize, buf: &mut [u8]) -> Result<usize, Errno> {
        self.readwrite(fd, buf, &[], OpenFlags::RDONLY)
    }

    /// Writes to descriptor `fd` at its seek position.
    ///
    /// A successful write of zero bytes is reported as `EIO`. This aliases
    /// block-device end-of-media with "wrote nothing"; callers that need
    /// the distinction must check the device state themselves.
    pub fn write(&self, fd: usize, buf: &[u8]) -> Result<usize, Errno> {
        self.readwrite(fd, &mut [], buf, OpenFlags::WRONLY)
    }

    fn readwrite(
        &self,
        fd: usize,
        rbuf: &mut [u8],
        wbuf: &[u8],
        oper: OpenFlags,
    ) -> Result<usize, Errno> {
        let file = self.fildes_ref(fd, 1).ok_or(Errno::EBADF)?;

        let res = if !file.oflags.contains(oper) {
            Err(Errno::EBADF)
        } else if oper == OpenFlags::RDONLY {
            file.vnode.ops().read(&file, rbuf)
        } else {
            match file.vnode.ops().write(&file, wbuf) {
                Ok(0) => Err(Errno::EIO),
                other => other,
            }
        };

        self.fildes_ref(fd, -1);
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vnode::VnodeOps;
    use alloc::sync::Weak;

    struct StubOps;
    impl VnodeOps for StubOps {}

    fn open_stub(files: &Files, oflags: OpenFlags) -> usize {
        let vn = Vnode::new(1, Mode::IFREG, Arc::new(StubOps), Weak::new());
        vn.refset(1);
        files
            .fildes_next(FileDesc::new(vn, oflags), 0)
            .expect("slot")
    }

    #[test]
    fn test_alloc_scans_from_start() {
        let files = Files::new(4);
        assert_eq!(open_stub(&files, OpenFlags::RDONLY), 0);
        assert_eq!(open_stub(&files, OpenFlags::RDONLY), 1);
        files.close(0).unwrap();
        assert_eq!(open_stub(&files, OpenFlags::RDONLY), 0);
    }

    #[test]
    fn test_table_exhaustion() {
        let files = Files::new(2);
        open_stub(&files, OpenFlags::RDONLY);
        open_stub(&files, OpenFlags::RDONLY);
        let vn = Vnode::new(9, Mode::IFREG, Arc::new(StubOps), Weak::new());
        vn.refset(1);
        assert_eq!(
            files
                .fildes_next(FileDesc::new(vn, OpenFlags::RDONLY), 0)
                .unwrap_err(),
            Errno::ENFILE
        );
    }

    #[test]
    fn test_access_mode_enforced() {
        let files = Files::new(4);
        let fd = open_stub(&files, OpenFlags::RDONLY);
        assert_eq!(files.write(fd, b"x").unwrap_err(), Errno::EBADF);
        let mut buf = [0u8; 4];
        // StubOps has no read implementation.
        assert_eq!(files.read(fd, &mut buf).unwrap_err(), Errno::ENOTSUP);
    }

    #[test]
    fn test_close_clears_slot() {
        let files = Files::new(4);
        let fd = open_stub(&files, OpenFlags::RDONLY);
        files.close(fd).unwrap();
        assert_eq!(files.close(fd).unwrap_err(), Errno::EBADF);
    }

    #[test]
    fn test_bad_fd() {
        let files = Files::new(2);
        let mut buf = [0u8; 1];
        assert_eq!(files.read(7, &mut buf).unwrap_err(), Errno::EBADF);
    }
}
