//! The low-level filesystem interface the session dispatches to.
//!
//! Every operation takes the request header (node id and caller identity)
//! plus the decoded input, and answers with a [`Status`]. Defaults answer
//! `ENOSYS`, so implementations only provide what they support.

use crate::raw::*;
use crate::session::Notifier;

#[allow(unused_variables)]
pub trait RawFileSystem: Send + Sync {
    /// Called once the session has a channel to the kernel.
    fn init(&self, notifier: Notifier) {}

    /// Called when the session ends: on DESTROY, on unmount and when the
    /// channel closes. May run more than once.
    fn destroy(&self) {}

    fn lookup(&self, header: &InHeader, name: &str, out: &mut EntryOut) -> Status {
        Status::ENOSYS
    }

    fn forget(&self, node_id: u64, nlookup: u64) {}

    fn getattr(&self, header: &InHeader, input: &GetAttrIn, out: &mut AttrOut) -> Status {
        Status::ENOSYS
    }

    fn setattr(&self, header: &InHeader, input: &SetAttrIn, out: &mut AttrOut) -> Status {
        Status::ENOSYS
    }

    fn readlink(&self, header: &InHeader) -> Result<Vec<u8>, Status> {
        Err(Status::ENOSYS)
    }

    fn mknod(&self, header: &InHeader, input: &MknodIn, name: &str, out: &mut EntryOut) -> Status {
        Status::ENOSYS
    }

    fn mkdir(&self, header: &InHeader, input: &MkdirIn, name: &str, out: &mut EntryOut) -> Status {
        Status::ENOSYS
    }

    fn unlink(&self, header: &InHeader, name: &str) -> Status {
        Status::ENOSYS
    }

    fn rmdir(&self, header: &InHeader, name: &str) -> Status {
        Status::ENOSYS
    }

    /// `name` is the new entry, `target` what it points to.
    fn symlink(&self, header: &InHeader, name: &str, target: &str, out: &mut EntryOut) -> Status {
        Status::ENOSYS
    }

    fn rename(&self, header: &InHeader, input: &RenameIn, old_name: &str, new_name: &str) -> Status {
        Status::ENOSYS
    }

    fn link(&self, header: &InHeader, input: &LinkIn, name: &str, out: &mut EntryOut) -> Status {
        Status::ENOSYS
    }

    fn getxattr(&self, header: &InHeader, attr: &str) -> Result<Vec<u8>, Status> {
        Err(Status::ENOSYS)
    }

    /// Attribute names, each NUL terminated.
    fn listxattr(&self, header: &InHeader) -> Result<Vec<u8>, Status> {
        Err(Status::ENOSYS)
    }

    fn setxattr(&self, header: &InHeader, input: &SetXAttrIn, attr: &str, data: &[u8]) -> Status {
        Status::ENOSYS
    }

    fn removexattr(&self, header: &InHeader, attr: &str) -> Status {
        Status::ENOSYS
    }

    fn access(&self, header: &InHeader, input: &AccessIn) -> Status {
        Status::ENOSYS
    }

    fn create(&self, header: &InHeader, input: &CreateIn, name: &str, out: &mut CreateOut) -> Status {
        Status::ENOSYS
    }

    fn open(&self, header: &InHeader, input: &OpenIn, out: &mut OpenOut) -> Status {
        Status::ENOSYS
    }

    /// Fill `buf` from the file; returns the number of bytes read.
    fn read(&self, header: &InHeader, input: &ReadIn, buf: &mut [u8]) -> Result<usize, Status> {
        Err(Status::ENOSYS)
    }

    fn write(&self, header: &InHeader, input: &WriteIn, data: &[u8]) -> Result<u32, Status> {
        Err(Status::ENOSYS)
    }

    fn release(&self, header: &InHeader, input: &ReleaseIn) {}

    fn flush(&self, header: &InHeader, input: &FlushIn) -> Status {
        Status::ENOSYS
    }

    fn fsync(&self, header: &InHeader, input: &FsyncIn) -> Status {
        Status::ENOSYS
    }

    fn opendir(&self, header: &InHeader, input: &OpenIn, out: &mut OpenOut) -> Status {
        Status::ENOSYS
    }

    fn readdir(&self, header: &InHeader, input: &ReadIn, out: &mut DirEntryList) -> Status {
        Status::ENOSYS
    }

    fn releasedir(&self, header: &InHeader, input: &ReleaseIn) {}

    fn fsyncdir(&self, header: &InHeader, input: &FsyncIn) -> Status {
        Status::ENOSYS
    }

    fn statfs(&self, header: &InHeader, out: &mut StatfsOut) -> Status {
        Status::ENOSYS
    }

    fn getlk(&self, header: &InHeader, input: &LkIn, out: &mut LkOut) -> Status {
        Status::ENOSYS
    }

    /// `sleep` is set for the blocking variant.
    fn setlk(&self, header: &InHeader, input: &LkIn, sleep: bool) -> Status {
        Status::ENOSYS
    }

    fn bmap(&self, header: &InHeader, input: &BmapIn, out: &mut BmapOut) -> Status {
        Status::ENOSYS
    }
}

/// Answers every operation with its default.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultRawFileSystem;

impl RawFileSystem for DefaultRawFileSystem {}
