//! # Path Resolution
//!
//! Turns a path string into a referenced vnode by walking components and
//! dispatching `lookup` to the filesystem of the directory currently held.
//! Mount boundaries are crossed in both directions: descending enters the
//! top of the mount stack on the child, and `..` at a filesystem root
//! exits through the base vnode underneath.

use alloc::sync::Arc;
use bitflags::bitflags;

use crate::error::Errno;
use crate::file::OpenFlags;
use crate::proc::FsProcess;
use crate::vnode::Vnode;
use crate::PATH_DELIMS;

bitflags! {
    /// Flags for the `*at()` style entry point.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AtFlags: u32 {
        /// Resolve relative paths against the given descriptor.
        const FDARG = 0x0001;
        /// Do not follow a trailing symbolic link (reserved).
        const SYMLINK_NOFOLLOW = 0x0002;
    }
}

/// Resolves `path` starting from the directory vnode `root`.
///
/// On success the returned vnode carries a new reference and is the top of
/// its mount stack. Symbolic links are not followed; `O_NOFOLLOW` and loop
/// detection are reserved for a future extension.
pub fn lookup_vnode(
    root: &Arc<Vnode>,
    path: &str,
    oflags: OpenFlags,
) -> Result<Arc<Vnode>, Errno> {
    let mut components = path
        .split(|c: char| PATH_DELIMS.contains(&c))
        .filter(|s| !s.is_empty())
        .peekable();
    if components.peek().is_none() && path.is_empty() {
        return Err(Errno::EINVAL);
    }

    root.vref()?;
    let mut result = root.clone();

    for name in components {
        if name == "." {
            continue;
        }

        loop {
            match result.ops().lookup(&result, name) {
                Ok(child) => {
                    // Hand-over: the driver gave us a reference on child.
                    // Descend through any mount stacked on it.
                    let top = Vnode::top_of(&child);
                    if !Arc::ptr_eq(&top, &child) {
                        if let Err(e) = top.vref() {
                            child.vrele();
                            result.vrele();
                            return Err(e);
                        }
                        child.vrele();
                    }
                    result.vrele();
                    result = top;
                    break;
                }
                Err(Errno::EDOM) => {
                    // At the root of this filesystem while resolving `..`:
                    // exit the mount through the base vnode and retry from
                    // there. At the initial root `..` resolves to itself.
                    let base = Vnode::base_of(&result);
                    if name == ".." && !Arc::ptr_eq(&base, &result) {
                        if let Err(e) = base.vref() {
                            result.vrele();
                            return Err(e);
                        }
                        result.vrele();
                        result = base;
                        continue;
                    }
                    break;
                }
                Err(e) => {
                    result.vrele();
                    return Err(e);
                }
            }
        }
    }

    if oflags.contains(OpenFlags::DIRECTORY) && !result.mode().is_dir() {
        result.vrele();
        return Err(Errno::ENOTDIR);
    }

    Ok(result)
}

/// Per-process path resolution.
///
/// Chooses the starting vnode: absolute paths start at the process root,
/// `AtFlags::FDARG` starts at the vnode of descriptor `fd`, and anything
/// else starts at the current working directory. A trailing separator
/// forces directory semantics.
pub fn namei(
    proc: &FsProcess,
    fd: usize,
    path: &str,
    atflags: AtFlags,
) -> Result<Arc<Vnode>, Errno> {
    let mut oflags = if atflags.contains(AtFlags::SYMLINK_NOFOLLOW) {
        OpenFlags::NOFOLLOW
    } else {
        OpenFlags::empty()
    };

    if path.is_empty() {
        return Err(Errno::EINVAL);
    }

    let fd_file;
    let (start, path) = if let Some(rest) = path
        .strip_prefix(|c: char| PATH_DELIMS.contains(&c))
    {
        let start = proc.croot();
        if rest.is_empty() {
            start.vref()?;
            return Ok(start);
        }
        fd_file = None;
        (start, rest)
    } else if atflags.contains(AtFlags::FDARG) {
        let file = proc.files().fildes_ref(fd, 1).ok_or(Errno::EBADF)?;
        let start = file.vnode().clone();
        fd_file = Some(file);
        (start, path)
    } else {
        fd_file = None;
        (proc.cwd(), path)
    };

    if path.ends_with(|c: char| PATH_DELIMS.contains(&c)) {
        oflags |= OpenFlags::DIRECTORY;
    }

    let res = lookup_vnode(&start, path, oflags);

    if fd_file.is_some() {
        proc.files().fildes_ref(fd, -1);
    }

    res
}
