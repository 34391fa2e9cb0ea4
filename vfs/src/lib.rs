//! # Virtual Filesystem Core
//!
//! The Onyx OS VFS: the layer between path-based operations and the
//! filesystem drivers underneath.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │              Process-level operations           │
//! │   open(), read(), write(), mkdir(), unlink()    │
//! ├─────────────────────────────────────────────────┤
//! │                      VFS                        │
//! │  - Filesystem driver registry                   │
//! │  - Mount tree of vnodes                         │
//! │  - Path resolution (namei)                      │
//! │  - File descriptor table                        │
//! │  - Permission checks                            │
//! ├─────────────────────────────────────────────────┤
//! │              Filesystem Drivers                 │
//! │        FatFs │ (others out of tree)             │
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! ## Vnodes and mounts
//!
//! Every filesystem object is represented by a reference-counted [`Vnode`].
//! Mounting stacks vnodes vertically: each vnode carries `prev`/`next`
//! neighbours forming the mount stack at its location, self-linked when
//! nothing is stacked. Path resolution descends to the top of a stack when
//! entering a mount and exits upward through the base vnode on `..`.

#![no_std]

extern crate alloc;

pub mod error;
pub mod file;
pub mod mount;
pub mod namei;
pub mod perm;
pub mod proc;
pub mod vnode;

pub use error::Errno;
pub use file::{FdFlags, FileDesc, Files, OpenFlags};
pub use mount::{
    by_name, iterate, mount, mount_root, register, umount, FsDriver, MountFlags, Superblock,
    SuperblockOps,
};
pub use namei::{lookup_vnode, namei, AtFlags};
pub use perm::{chkperm, chkperm_vnode, Access, Cred};
pub use proc::FsProcess;
pub use vnode::{Dirent, FileFlags, Mode, Stat, Timespec, Vnode, VnodeOps};

/// Limit for the length of a file name component.
pub const NAME_MAX: usize = 255;

/// Limit for the length of an entire path.
pub const PATH_MAX: usize = 4096;

/// Path separators accepted by the resolver.
pub const PATH_DELIMS: &[char] = &['/', '\\'];
