//! # Process-level Filesystem Operations
//!
//! The per-process view of the filesystem: root and current directories,
//! the open-file table, the file creation mask, and effective credentials,
//! carried as an explicit context rather than ambient state. The functions
//! here are the path-based operations a syscall layer would publish.

use alloc::string::{String, ToString};
use alloc::sync::Arc;

use spin::Mutex;

use crate::error::Errno;
use crate::file::{FileDesc, Files, OpenFlags};
use crate::namei::{namei, AtFlags};
use crate::perm::{chkperm_vnode, Access, Cred};
use crate::vnode::{Dirent, FileFlags, Mode, Stat, Timespec, Vnode};
use crate::PATH_DELIMS;

/// Default number of descriptor slots for a new process.
pub const NOFILE: usize = 64;

/// Per-process filesystem context.
pub struct FsProcess {
    croot: Mutex<Arc<Vnode>>,
    cwd: Mutex<Arc<Vnode>>,
    files: Files,
    cred: Mutex<Cred>,
}

impl FsProcess {
    /// Creates a process context rooted and working at `root`.
    pub fn new(root: Arc<Vnode>, cred: Cred) -> FsProcess {
        FsProcess {
            croot: Mutex::new(root.clone()),
            cwd: Mutex::new(root),
            files: Files::new(NOFILE),
            cred: Mutex::new(cred),
        }
    }

    /// Process root directory.
    pub fn croot(&self) -> Arc<Vnode> {
        self.croot.lock().clone()
    }

    /// Current working directory.
    pub fn cwd(&self) -> Arc<Vnode> {
        self.cwd.lock().clone()
    }

    /// Changes the current working directory.
    pub fn set_cwd(&self, cwd: Arc<Vnode>) {
        *self.cwd.lock() = cwd;
    }

    /// The open-file table.
    pub fn files(&self) -> &Files {
        &self.files
    }

    /// Effective credentials.
    pub fn cred(&self) -> Cred {
        *self.cred.lock()
    }

    /// Opens `path`, creating the file first when `O_CREAT` is set and the
    /// path does not resolve. Returns the new descriptor index.
    pub fn open(&self, path: &str, oflags: OpenFlags, mode: Mode) -> Result<usize, Errno> {
        let vnode = match namei(self, 0, path, AtFlags::empty()) {
            Ok(vnode) => {
                if oflags.contains(OpenFlags::CREAT | OpenFlags::EXCL) {
                    vnode.vrele();
                    return Err(Errno::EEXIST);
                }
                vnode
            }
            Err(Errno::ENOENT) if oflags.contains(OpenFlags::CREAT) => self.creat(path, mode)?,
            Err(e) => return Err(e),
        };

        let fd = self.fildes_create(&vnode, oflags);
        vnode.vrele();
        fd
    }

    /// Installs a descriptor for an already resolved vnode.
    ///
    /// Takes its own vnode reference; the caller keeps the one it holds.
    pub fn fildes_create(&self, vnode: &Arc<Vnode>, oflags: OpenFlags) -> Result<usize, Errno> {
        vnode.vref()?;

        let result = (|| {
            let cred = self.cred();
            if cred.euid != 0 {
                let mut amode = Access::empty();
                if oflags.contains(OpenFlags::RDONLY) {
                    amode |= Access::R;
                }
                if oflags.contains(OpenFlags::WRONLY) {
                    amode |= Access::W;
                }
                chkperm_vnode(vnode, &cred, amode)?;
            }

            if oflags.contains(OpenFlags::DIRECTORY) && !vnode.mode().is_dir() {
                return Err(Errno::ENOTDIR);
            }

            vnode.ops().file_opened(vnode, oflags)?;

            self.files.fildes_next(FileDesc::new(vnode.clone(), oflags), 0)
        })();

        if result.is_err() {
            vnode.vrele();
        }
        result
    }

    /// Closes a descriptor.
    pub fn close(&self, fd: usize) -> Result<(), Errno> {
        self.files.close(fd)
    }

    /// Creates a regular file and returns its referenced vnode.
    pub fn creat(&self, path: &str, mode: Mode) -> Result<Arc<Vnode>, Errno> {
        let (dir, name) = self.getvndir(path, true)?;
        let mode = mode.perm_bits() & !self.files.umask();
        let res = dir.ops().create(&dir, &name, mode);
        dir.vrele();
        res
    }

    /// Removes a directory entry. Directories are refused for non-root
    /// callers; write permission on the containing directory is required.
    pub fn unlink(&self, path: &str) -> Result<(), Errno> {
        {
            let fnode = namei(self, 0, path, AtFlags::empty())?;
            let stat = fnode.ops().stat(&fnode);
            fnode.vrele();
            let stat = stat?;
            let is_dir = (stat.st_mode & Mode::IFMT) == Mode::IFDIR.bits();
            if is_dir && self.cred().euid != 0 {
                return Err(Errno::EPERM);
            }
        }

        let (dir, name) = self.getvndir(path, false)?;
        let res = self
            .chkperm_write_dir(&dir)
            .and_then(|()| dir.ops().unlink(&dir, &name));
        dir.vrele();
        res
    }

    /// Creates a directory.
    pub fn mkdir(&self, path: &str, mode: Mode) -> Result<(), Errno> {
        let (dir, name) = self.getvndir(path, true)?;
        let res = self.chkperm_write_dir(&dir).and_then(|()| {
            let mode = mode.perm_bits() & !self.files.umask();
            dir.ops().mkdir(&dir, &name, mode)
        });
        dir.vrele();
        res
    }

    /// Removes an empty directory.
    pub fn rmdir(&self, path: &str) -> Result<(), Errno> {
        let (dir, name) = self.getvndir(path, false)?;
        let res = self
            .chkperm_write_dir(&dir)
            .and_then(|()| dir.ops().rmdir(&dir, &name));
        dir.vrele();
        res
    }

    /// Creates a hard link `path2` to the file at `path1`. Both must live
    /// on the same filesystem instance.
    pub fn link(&self, path1: &str, path2: &str) -> Result<(), Errno> {
        let src = namei(self, 0, path1, AtFlags::empty())?;

        let res = (|| {
            if self.cred().euid != 0 {
                chkperm_vnode(&src, &self.cred(), Access::W)?;
            }
            let (dir, name) = self.getvndir(path2, true)?;

            let res = (|| {
                let src_dev = src.superblock().map(|sb| sb.vdev_id());
                let dst_dev = dir.superblock().map(|sb| sb.vdev_id());
                if src_dev != dst_dev {
                    return Err(Errno::EXDEV);
                }
                self.chkperm_write_dir(&dir)?;
                dir.ops().link(&dir, &src, &name)
            })();
            dir.vrele();
            res
        })();

        src.vrele();
        res
    }

    /// Reads from a descriptor.
    pub fn read(&self, fd: usize, buf: &mut [u8]) -> Result<usize, Errno> {
        self.files.read(fd, buf)
    }

    /// Writes to a descriptor.
    pub fn write(&self, fd: usize, buf: &[u8]) -> Result<usize, Errno> {
        self.files.write(fd, buf)
    }

    /// Issues a control operation on a descriptor.
    pub fn ioctl(&self, fd: usize, request: u32, arg: &mut [u8]) -> Result<(), Errno> {
        let file = self.files.fildes_ref(fd, 1).ok_or(Errno::EBADF)?;
        let vnode = file.vnode().clone();
        let res = vnode.ops().ioctl(&file, request, arg);
        self.files.fildes_ref(fd, -1);
        res
    }

    /// Reads the next directory entry from a descriptor opened on a
    /// directory, using the seek position as the iteration cursor.
    pub fn readdir(&self, fd: usize) -> Result<Option<Dirent>, Errno> {
        let file = self.files.fildes_ref(fd, 1).ok_or(Errno::EBADF)?;
        let vnode = file.vnode().clone();
        let mut off = file.seek_pos() as u64;
        let res = vnode.ops().readdir(&vnode, &mut off);
        file.set_seek_pos(off as i64);
        self.files.fildes_ref(fd, -1);
        res
    }

    /// Stats the object behind a descriptor.
    pub fn fstat(&self, fd: usize) -> Result<Stat, Errno> {
        let file = self.files.fildes_ref(fd, 1).ok_or(Errno::EBADF)?;
        let vnode = file.vnode().clone();
        let res = vnode.ops().stat(&vnode);
        self.files.fildes_ref(fd, -1);
        res
    }

    /// Stats a path.
    pub fn stat(&self, path: &str) -> Result<Stat, Errno> {
        let vnode = namei(self, 0, path, AtFlags::empty())?;
        let res = vnode.ops().stat(&vnode);
        vnode.vrele();
        res
    }

    /// Changes timestamps through a writable descriptor.
    pub fn utimes(&self, fd: usize, times: &[Timespec; 2]) -> Result<(), Errno> {
        self.with_writable_fd(fd, |vnode| vnode.ops().utimes(vnode, times))
    }

    /// Changes permission bits through a writable descriptor.
    pub fn chmod(&self, fd: usize, mode: Mode) -> Result<(), Errno> {
        self.with_writable_fd(fd, |vnode| vnode.ops().chmod(vnode, mode))
    }

    /// Changes file flags through a writable descriptor.
    pub fn chflags(&self, fd: usize, flags: FileFlags) -> Result<(), Errno> {
        self.with_writable_fd(fd, |vnode| vnode.ops().chflags(vnode, flags))
    }

    /// Changes owner and group through a writable descriptor.
    pub fn chown(&self, fd: usize, uid: u32, gid: u32) -> Result<(), Errno> {
        self.with_writable_fd(fd, |vnode| vnode.ops().chown(vnode, uid, gid))
    }

    fn with_writable_fd(
        &self,
        fd: usize,
        f: impl FnOnce(&Arc<Vnode>) -> Result<(), Errno>,
    ) -> Result<(), Errno> {
        let file = self.files.fildes_ref(fd, 1).ok_or(Errno::EBADF)?;
        let vnode = file.vnode().clone();

        let writable = file.oflags().contains(OpenFlags::WRONLY)
            || chkperm_vnode(&vnode, &self.cred(), Access::W).is_ok();
        let res = if writable { f(&vnode) } else { Err(Errno::EPERM) };

        self.files.fildes_ref(fd, -1);
        res
    }

    fn chkperm_write_dir(&self, dir: &Arc<Vnode>) -> Result<(), Errno> {
        if self.cred().euid == 0 {
            return Ok(());
        }
        chkperm_vnode(dir, &self.cred(), Access::W).map_err(|e| {
            if e == Errno::EPERM {
                Errno::EACCES
            } else {
                e
            }
        })
    }

    /// Resolves the directory part of `path` and returns it referenced
    /// together with the final component name. With `must_not_exist` the
    /// full path is required to not resolve yet.
    fn getvndir(&self, path: &str, must_not_exist: bool) -> Result<(Arc<Vnode>, String), Errno> {
        if path.is_empty() {
            return Err(Errno::EINVAL);
        }

        match namei(self, 0, path, AtFlags::empty()) {
            Ok(vnode) => {
                vnode.vrele();
                if must_not_exist {
                    return Err(Errno::EEXIST);
                }
            }
            Err(Errno::ENOENT) if must_not_exist => {}
            Err(e) => return Err(e),
        }

        let (dirpath, name) = parsenames(path)?;
        let dir = namei(self, 0, &dirpath, AtFlags::empty())?;
        Ok((dir, name))
    }
}

/// Splits a path into the containing directory and the entry name.
/// Trailing separators on the entry name are ignored.
pub fn parsenames(path: &str) -> Result<(String, String), Errno> {
    let trimmed = path.trim_end_matches(|c: char| PATH_DELIMS.contains(&c));
    if trimmed.is_empty() {
        return Err(Errno::EINVAL);
    }

    let (dir, name) = match trimmed.rfind(|c: char| PATH_DELIMS.contains(&c)) {
        Some(pos) => {
            let (d, n) = trimmed.split_at(pos);
            (if d.is_empty() { "/" } else { d }, &n[1..])
        }
        None => (".", trimmed),
    };
    if name.is_empty() || name.len() > crate::NAME_MAX {
        return Err(Errno::EINVAL);
    }

    Ok((dir.to_string(), name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parsenames() {
        assert_eq!(
            parsenames("/a/b/c").unwrap(),
            ("/a/b".to_string(), "c".to_string())
        );
        assert_eq!(parsenames("/a").unwrap(), ("/".to_string(), "a".to_string()));
        assert_eq!(parsenames("a").unwrap(), (".".to_string(), "a".to_string()));
        assert_eq!(
            parsenames("/a/b/").unwrap(),
            ("/a".to_string(), "b".to_string())
        );
        assert!(parsenames("/").is_err());
        assert!(parsenames("").is_err());
    }
}
