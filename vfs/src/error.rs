//! # VFS Errors
//!
//! The POSIX-style error vocabulary returned across the VFS boundary.
//! Filesystem drivers keep their own error enums and translate to [`Errno`]
//! when entering the VFS; the two vocabularies never mix.

/// VFS error numbers.
///
/// The discriminants follow the classic errno values so the syscall layer
/// can negate them directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Errno {
    /// Operation not permitted
    EPERM = 1,
    /// No such file or directory
    ENOENT = 2,
    /// I/O error
    EIO = 5,
    /// Bad file descriptor
    EBADF = 9,
    /// Out of memory
    ENOMEM = 12,
    /// Permission denied
    EACCES = 13,
    /// Device or resource busy
    EBUSY = 16,
    /// File exists
    EEXIST = 17,
    /// Cross-device link
    EXDEV = 18,
    /// Not a directory
    ENOTDIR = 20,
    /// Is a directory
    EISDIR = 21,
    /// Invalid argument
    EINVAL = 22,
    /// Too many open files in system
    ENFILE = 23,
    /// Too many open files
    EMFILE = 24,
    /// Inappropriate ioctl for device
    ENOTTY = 25,
    /// No space left on device
    ENOSPC = 28,
    /// Read-only filesystem
    EROFS = 30,
    /// Math argument out of domain.
    ///
    /// Borrowed by `lookup` to signal "`..` at the root of this filesystem";
    /// the resolver exits the mount through the base vnode and retries.
    EDOM = 33,
    /// Directory not empty
    ENOTEMPTY = 66,
    /// Link has been severed (vnode is being freed)
    ENOLINK = 67,
    /// Operation not supported
    ENOTSUP = 95,
    /// Connection timed out
    ETIMEDOUT = 110,
}

impl Errno {
    /// Returns the negated errno value for the syscall boundary.
    pub fn as_neg(self) -> i32 {
        -(self as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negated_values() {
        assert_eq!(Errno::ENOENT.as_neg(), -2);
        assert_eq!(Errno::ENOTSUP.as_neg(), -95);
    }
}
