//! # Permission Checks
//!
//! POSIX owner/group/other permission evaluation against an object's stat
//! data and a caller's effective credentials. Directory traversal always
//! requires execute permission. Effective uid 0 bypasses the check at the
//! call sites that allow it.

use alloc::sync::Arc;
use bitflags::bitflags;

use crate::error::Errno;
use crate::vnode::{Mode, Stat, Vnode};

bitflags! {
    /// Requested access modes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Access: u32 {
        const R = 0x4;
        const W = 0x2;
        const X = 0x1;
    }
}

/// Effective credentials of a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cred {
    pub euid: u32,
    pub egid: u32,
}

impl Cred {
    pub const ROOT: Cred = Cred { euid: 0, egid: 0 };
}

/// Checks the requested access modes against `stat`.
///
/// For each requested mode at least one of the owner/group/other bits must
/// be set; owner and group bits only count when the caller's effective ids
/// match. Directories additionally require execute permission.
pub fn chkperm(stat: &Stat, euid: u32, egid: u32, amode: Access) -> Result<(), Errno> {
    let mode = Mode::from_bits_truncate(stat.st_mode);

    if amode.contains(Access::R) {
        let mut req = Mode::empty();
        if stat.st_uid == euid {
            req |= Mode::IRUSR;
        }
        if stat.st_gid == egid {
            req |= Mode::IRGRP;
        }
        req |= Mode::IROTH;

        if !mode.intersects(req) {
            return Err(Errno::EPERM);
        }
    }

    if amode.contains(Access::W) {
        let mut req = Mode::empty();
        if stat.st_uid == euid {
            req |= Mode::IWUSR;
        }
        if stat.st_gid == egid {
            req |= Mode::IWGRP;
        }
        req |= Mode::IWOTH;

        if !mode.intersects(req) {
            return Err(Errno::EPERM);
        }
    }

    let is_dir = (stat.st_mode & Mode::IFMT) == Mode::IFDIR.bits();
    if amode.contains(Access::X) || is_dir {
        let mut req = Mode::empty();
        if stat.st_uid == euid {
            req |= Mode::IXUSR;
        }
        if stat.st_gid == egid {
            req |= Mode::IXGRP;
        }
        req |= Mode::IXOTH;

        if !mode.intersects(req) {
            return Err(Errno::EPERM);
        }
    }

    Ok(())
}

/// Stats `vnode` and checks access for the given credentials.
pub fn chkperm_vnode(vnode: &Arc<Vnode>, cred: &Cred, amode: Access) -> Result<(), Errno> {
    let stat = vnode.ops().stat(vnode)?;
    chkperm(&stat, cred.euid, cred.egid, amode)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stat_with(mode: u32, uid: u32, gid: u32) -> Stat {
        Stat {
            st_mode: mode,
            st_uid: uid,
            st_gid: gid,
            ..Stat::default()
        }
    }

    #[test]
    fn test_owner_bits() {
        let stat = stat_with(Mode::IFREG.bits() | 0o600, 100, 100);
        assert!(chkperm(&stat, 100, 100, Access::R | Access::W).is_ok());
        assert_eq!(chkperm(&stat, 101, 101, Access::R), Err(Errno::EPERM));
    }

    #[test]
    fn test_group_bits() {
        let stat = stat_with(Mode::IFREG.bits() | 0o040, 100, 200);
        assert!(chkperm(&stat, 999, 200, Access::R).is_ok());
        assert_eq!(chkperm(&stat, 999, 201, Access::R), Err(Errno::EPERM));
    }

    #[test]
    fn test_other_bits() {
        let stat = stat_with(Mode::IFREG.bits() | 0o004, 100, 100);
        assert!(chkperm(&stat, 999, 999, Access::R).is_ok());
        assert_eq!(chkperm(&stat, 999, 999, Access::W), Err(Errno::EPERM));
    }

    #[test]
    fn test_directory_requires_exec() {
        let stat = stat_with(Mode::IFDIR.bits() | 0o600, 100, 100);
        assert_eq!(chkperm(&stat, 100, 100, Access::R), Err(Errno::EPERM));
        let stat = stat_with(Mode::IFDIR.bits() | 0o700, 100, 100);
        assert!(chkperm(&stat, 100, 100, Access::R).is_ok());
    }
}
