//! Inode-tree filesystem layer.
//!
//! The [`FileSystemConnector`] implements [`RawFileSystem`](crate::rawfs::RawFileSystem)
//! on top of a tree of [`Inode`]s, each backed by an [`FsNode`] supplied by
//! the filesystem implementation. It owns node id allocation, kernel lookup
//! accounting, open handles and nested mounts.

mod connector;
mod dir;
mod files;
mod fsops;
mod inode;
mod mount;

use std::any::Any;
use std::sync::Arc;
use std::time::SystemTime;

pub use connector::FileSystemConnector;
pub use dir::DirEntry;
pub use files::{DataFile, LoopbackFile};
pub use inode::Inode;
pub use mount::{FileSystemMount, OpenedFile};

use crate::raw::{Attr, Kstatfs, Status};
use crate::request::Context;

/// Lets a node be recovered as its concrete type.
pub trait AsAny {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// What a child-creating operation hands back: the new or existing child
/// inode, already linked under its parent, and its attributes.
pub type NewEntry = (Arc<Inode>, Attr);

/// Per-node behavior of a filesystem.
///
/// Methods that create children receive the node's own inode as `inode`
/// and must link the child under it (see [`Inode::new_child`] and
/// [`Inode::add_child`]). Removals and renames of children are mirrored in
/// the tree by the connector once the node reports success.
#[allow(unused_variables)]
pub trait FsNode: AsAny + Send + Sync {
    /// Called once, when the node is placed in the tree.
    fn on_attach(&self, inode: &Arc<Inode>) {}

    /// Called once, when the node leaves the tree for good.
    fn on_forget(&self) {}

    /// Whether the node may be dropped once the kernel forgets it.
    fn deletable(&self) -> bool {
        true
    }

    fn lookup(&self, inode: &Arc<Inode>, name: &str, ctx: &Context) -> Result<NewEntry, Status> {
        Err(Status::ENOENT)
    }

    fn get_attr(&self, ctx: &Context) -> Result<Attr, Status> {
        Err(Status::ENOSYS)
    }

    fn readlink(&self, ctx: &Context) -> Result<Vec<u8>, Status> {
        Err(Status::ENOSYS)
    }

    fn mknod(
        &self,
        inode: &Arc<Inode>,
        name: &str,
        mode: u32,
        dev: u32,
        ctx: &Context,
    ) -> Result<NewEntry, Status> {
        Err(Status::ENOSYS)
    }

    fn mkdir(&self, inode: &Arc<Inode>, name: &str, mode: u32, ctx: &Context) -> Result<NewEntry, Status> {
        Err(Status::ENOSYS)
    }

    fn unlink(&self, inode: &Arc<Inode>, name: &str, ctx: &Context) -> Status {
        Status::ENOSYS
    }

    fn rmdir(&self, inode: &Arc<Inode>, name: &str, ctx: &Context) -> Status {
        Status::ENOSYS
    }

    fn symlink(
        &self,
        inode: &Arc<Inode>,
        name: &str,
        target: &str,
        ctx: &Context,
    ) -> Result<NewEntry, Status> {
        Err(Status::ENOSYS)
    }

    fn rename(
        &self,
        inode: &Arc<Inode>,
        old_name: &str,
        new_parent: &Arc<Inode>,
        new_name: &str,
        ctx: &Context,
    ) -> Status {
        Status::ENOSYS
    }

    /// Create `name` as another name for `existing`.
    fn link(
        &self,
        inode: &Arc<Inode>,
        name: &str,
        existing: &Arc<Inode>,
        ctx: &Context,
    ) -> Result<NewEntry, Status> {
        Err(Status::ENOSYS)
    }

    fn create(
        &self,
        inode: &Arc<Inode>,
        name: &str,
        flags: u32,
        mode: u32,
        ctx: &Context,
    ) -> Result<(Box<dyn File>, Arc<Inode>, Attr), Status> {
        Err(Status::ENOSYS)
    }

    fn open(&self, flags: u32, ctx: &Context) -> Result<Box<dyn File>, Status> {
        Err(Status::ENOSYS)
    }

    fn open_dir(&self, ctx: &Context) -> Result<Vec<DirEntry>, Status> {
        Err(Status::ENOSYS)
    }

    fn get_xattr(&self, attr: &str, ctx: &Context) -> Result<Vec<u8>, Status> {
        Err(Status::ENOSYS)
    }

    fn list_xattr(&self, ctx: &Context) -> Result<Vec<String>, Status> {
        Err(Status::ENOSYS)
    }

    fn set_xattr(&self, attr: &str, data: &[u8], flags: u32, ctx: &Context) -> Status {
        Status::ENOSYS
    }

    fn remove_xattr(&self, attr: &str, ctx: &Context) -> Status {
        Status::ENOSYS
    }

    fn access(&self, mask: u32, ctx: &Context) -> Status {
        Status::ENOSYS
    }

    fn chmod(&self, perms: u32, ctx: &Context) -> Status {
        Status::ENOSYS
    }

    fn chown(&self, uid: Option<u32>, gid: Option<u32>, ctx: &Context) -> Status {
        Status::ENOSYS
    }

    fn truncate(&self, size: u64, ctx: &Context) -> Status {
        Status::ENOSYS
    }

    fn utimens(&self, atime: Option<SystemTime>, mtime: Option<SystemTime>, ctx: &Context) -> Status {
        Status::ENOSYS
    }

    fn statfs(&self) -> Result<Kstatfs, Status> {
        Err(Status::ENOSYS)
    }
}

impl dyn FsNode {
    pub fn downcast_ref<T: FsNode + Any>(&self) -> Option<&T> {
        AsAny::as_any(self).downcast_ref::<T>()
    }
}

/// A node with no behavior of its own; useful as a plain directory.
#[derive(Debug, Default)]
pub struct DefaultFsNode;

impl FsNode for DefaultFsNode {}

/// A filesystem that can be mounted into the tree.
pub trait NodeFileSystem: Send + Sync {
    /// The node backing the mount's root inode.
    fn root(&self) -> Arc<dyn FsNode>;

    fn on_mount(&self, connector: &Arc<FileSystemConnector>) {
        let _ = connector;
    }

    fn on_unmount(&self) {}

    fn name(&self) -> String {
        "nodefs".to_string()
    }
}

/// An open file.
///
/// Operations that take an open handle go here first; `ENOSYS` makes the
/// connector fall back to the node.
#[allow(unused_variables)]
pub trait File: Send + Sync {
    /// Extra FOPEN_* flags to report to the kernel.
    fn open_flags(&self) -> u32 {
        0
    }

    fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize, Status> {
        Err(Status::ENOSYS)
    }

    fn write(&self, data: &[u8], offset: u64) -> Result<u32, Status> {
        Err(Status::ENOSYS)
    }

    fn flush(&self) -> Status {
        Status::OK
    }

    fn release(&self) {}

    fn fsync(&self, flags: u32) -> Status {
        Status::ENOSYS
    }

    fn get_attr(&self) -> Result<Attr, Status> {
        Err(Status::ENOSYS)
    }

    fn chmod(&self, perms: u32) -> Status {
        Status::ENOSYS
    }

    fn chown(&self, uid: Option<u32>, gid: Option<u32>) -> Status {
        Status::ENOSYS
    }

    fn truncate(&self, size: u64) -> Status {
        Status::ENOSYS
    }

    fn utimens(&self, atime: Option<SystemTime>, mtime: Option<SystemTime>) -> Status {
        Status::ENOSYS
    }
}
