//! Path-based filesystems.
//!
//! A [`PathFileSystem`] answers every operation in terms of a slash separated
//! path relative to its root (`""` is the root itself). [`PathNodeFs`] adapts
//! one to the node protocol so it can be served by a
//! [`FileSystemConnector`](crate::nodefs::FileSystemConnector).

mod loopback;
mod pathnode;

use std::sync::Arc;
use std::time::SystemTime;

pub use loopback::LoopbackFileSystem;
pub use pathnode::{PathInode, PathNodeFs};

use crate::nodefs::{DirEntry, File};
use crate::raw::{Attr, Kstatfs, Status};
use crate::request::Context;

/// A filesystem addressed by path. Every operation defaults to `ENOSYS`.
#[allow(unused_variables)]
pub trait PathFileSystem: Send + Sync {
    fn name(&self) -> String {
        "pathfs".to_string()
    }

    fn on_mount(&self, pathfs: &Arc<PathNodeFs>) {}

    fn on_unmount(&self) {}

    fn get_attr(&self, name: &str, ctx: &Context) -> Result<Attr, Status> {
        Err(Status::ENOSYS)
    }

    fn chmod(&self, name: &str, mode: u32, ctx: &Context) -> Status {
        Status::ENOSYS
    }

    fn chown(&self, name: &str, uid: Option<u32>, gid: Option<u32>, ctx: &Context) -> Status {
        Status::ENOSYS
    }

    fn utimens(
        &self,
        name: &str,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
        ctx: &Context,
    ) -> Status {
        Status::ENOSYS
    }

    fn truncate(&self, name: &str, size: u64, ctx: &Context) -> Status {
        Status::ENOSYS
    }

    fn access(&self, name: &str, mask: u32, ctx: &Context) -> Status {
        Status::ENOSYS
    }

    fn link(&self, old_name: &str, new_name: &str, ctx: &Context) -> Status {
        Status::ENOSYS
    }

    fn mkdir(&self, name: &str, mode: u32, ctx: &Context) -> Status {
        Status::ENOSYS
    }

    fn mknod(&self, name: &str, mode: u32, dev: u32, ctx: &Context) -> Status {
        Status::ENOSYS
    }

    fn rename(&self, old_name: &str, new_name: &str, ctx: &Context) -> Status {
        Status::ENOSYS
    }

    fn rmdir(&self, name: &str, ctx: &Context) -> Status {
        Status::ENOSYS
    }

    fn unlink(&self, name: &str, ctx: &Context) -> Status {
        Status::ENOSYS
    }

    fn get_xattr(&self, name: &str, attr: &str, ctx: &Context) -> Result<Vec<u8>, Status> {
        Err(Status::ENOSYS)
    }

    fn list_xattr(&self, name: &str, ctx: &Context) -> Result<Vec<String>, Status> {
        Err(Status::ENOSYS)
    }

    fn remove_xattr(&self, name: &str, attr: &str, ctx: &Context) -> Status {
        Status::ENOSYS
    }

    fn set_xattr(&self, name: &str, attr: &str, data: &[u8], flags: u32, ctx: &Context) -> Status {
        Status::ENOSYS
    }

    fn open(&self, name: &str, flags: u32, ctx: &Context) -> Result<Box<dyn File>, Status> {
        Err(Status::ENOSYS)
    }

    fn create(&self, name: &str, flags: u32, mode: u32, ctx: &Context) -> Result<Box<dyn File>, Status> {
        Err(Status::ENOSYS)
    }

    fn open_dir(&self, name: &str, ctx: &Context) -> Result<Vec<DirEntry>, Status> {
        Err(Status::ENOSYS)
    }

    fn symlink(&self, value: &str, link_name: &str, ctx: &Context) -> Status {
        Status::ENOSYS
    }

    fn readlink(&self, name: &str, ctx: &Context) -> Result<Vec<u8>, Status> {
        Err(Status::ENOSYS)
    }

    fn statfs(&self, name: &str) -> Result<Kstatfs, Status> {
        Err(Status::ENOSYS)
    }
}

/// `name` inside directory `dir`, both relative to the filesystem root.
pub fn join_path(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir, name)
    }
}
