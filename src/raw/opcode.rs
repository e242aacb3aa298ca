use std::fmt;
use std::mem::size_of;

use crate::raw::types::*;

/// FUSE operation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Opcode {
    Lookup = 1,
    Forget = 2,
    GetAttr = 3,
    SetAttr = 4,
    Readlink = 5,
    Symlink = 6,
    Mknod = 8,
    Mkdir = 9,
    Unlink = 10,
    Rmdir = 11,
    Rename = 12,
    Link = 13,
    Open = 14,
    Read = 15,
    Write = 16,
    Statfs = 17,
    Release = 18,
    Fsync = 20,
    SetXAttr = 21,
    GetXAttr = 22,
    ListXAttr = 23,
    RemoveXAttr = 24,
    Flush = 25,
    Init = 26,
    OpenDir = 27,
    ReadDir = 28,
    ReleaseDir = 29,
    FsyncDir = 30,
    GetLk = 31,
    SetLk = 32,
    SetLkw = 33,
    Access = 34,
    Create = 35,
    Interrupt = 36,
    Bmap = 37,
    Destroy = 38,
    Ioctl = 39,
    Poll = 40,
    NotifyReply = 41,
    BatchForget = 42,
}

/// Static description of one opcode's wire shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpInfo {
    pub name: &'static str,
    /// Size of the fixed input struct following the header.
    pub input_size: usize,
    /// Size of the fixed output struct following the reply header.
    pub output_size: usize,
    /// Number of NUL-terminated names following the fixed input.
    pub file_names: usize,
    /// The reply body is a single name (readlink).
    pub file_name_out: bool,
}

const fn info(
    name: &'static str,
    input_size: usize,
    output_size: usize,
    file_names: usize,
) -> OpInfo {
    OpInfo {
        name,
        input_size,
        output_size,
        file_names,
        file_name_out: false,
    }
}

impl Opcode {
    pub const ALL: [Opcode; 40] = [
        Opcode::Lookup,
        Opcode::Forget,
        Opcode::GetAttr,
        Opcode::SetAttr,
        Opcode::Readlink,
        Opcode::Symlink,
        Opcode::Mknod,
        Opcode::Mkdir,
        Opcode::Unlink,
        Opcode::Rmdir,
        Opcode::Rename,
        Opcode::Link,
        Opcode::Open,
        Opcode::Read,
        Opcode::Write,
        Opcode::Statfs,
        Opcode::Release,
        Opcode::Fsync,
        Opcode::SetXAttr,
        Opcode::GetXAttr,
        Opcode::ListXAttr,
        Opcode::RemoveXAttr,
        Opcode::Flush,
        Opcode::Init,
        Opcode::OpenDir,
        Opcode::ReadDir,
        Opcode::ReleaseDir,
        Opcode::FsyncDir,
        Opcode::GetLk,
        Opcode::SetLk,
        Opcode::SetLkw,
        Opcode::Access,
        Opcode::Create,
        Opcode::Interrupt,
        Opcode::Bmap,
        Opcode::Destroy,
        Opcode::Ioctl,
        Opcode::Poll,
        Opcode::NotifyReply,
        Opcode::BatchForget,
    ];

    pub fn from_u32(value: u32) -> Option<Opcode> {
        Opcode::ALL.iter().copied().find(|op| *op as u32 == value)
    }

    pub fn info(self) -> OpInfo {
        match self {
            Opcode::Lookup => info("LOOKUP", 0, size_of::<EntryOut>(), 1),
            Opcode::Forget => info("FORGET", size_of::<ForgetIn>(), 0, 0),
            Opcode::GetAttr => info("GETATTR", size_of::<GetAttrIn>(), size_of::<AttrOut>(), 0),
            Opcode::SetAttr => info("SETATTR", size_of::<SetAttrIn>(), size_of::<AttrOut>(), 0),
            Opcode::Readlink => OpInfo {
                file_name_out: true,
                ..info("READLINK", 0, 0, 0)
            },
            Opcode::Symlink => info("SYMLINK", 0, size_of::<EntryOut>(), 2),
            Opcode::Mknod => info("MKNOD", size_of::<MknodIn>(), size_of::<EntryOut>(), 1),
            Opcode::Mkdir => info("MKDIR", size_of::<MkdirIn>(), size_of::<EntryOut>(), 1),
            Opcode::Unlink => info("UNLINK", 0, 0, 1),
            Opcode::Rmdir => info("RMDIR", 0, 0, 1),
            Opcode::Rename => info("RENAME", size_of::<RenameIn>(), 0, 2),
            Opcode::Link => info("LINK", size_of::<LinkIn>(), size_of::<EntryOut>(), 1),
            Opcode::Open => info("OPEN", size_of::<OpenIn>(), size_of::<OpenOut>(), 0),
            Opcode::Read => info("READ", size_of::<ReadIn>(), 0, 0),
            Opcode::Write => info("WRITE", size_of::<WriteIn>(), size_of::<WriteOut>(), 0),
            Opcode::Statfs => info("STATFS", 0, size_of::<StatfsOut>(), 0),
            Opcode::Release => info("RELEASE", size_of::<ReleaseIn>(), 0, 0),
            Opcode::Fsync => info("FSYNC", size_of::<FsyncIn>(), 0, 0),
            Opcode::SetXAttr => info("SETXATTR", size_of::<SetXAttrIn>(), 0, 1),
            Opcode::GetXAttr => info(
                "GETXATTR",
                size_of::<GetXAttrIn>(),
                size_of::<GetXAttrOut>(),
                1,
            ),
            Opcode::ListXAttr => info(
                "LISTXATTR",
                size_of::<GetXAttrIn>(),
                size_of::<GetXAttrOut>(),
                0,
            ),
            Opcode::RemoveXAttr => info("REMOVEXATTR", 0, 0, 1),
            Opcode::Flush => info("FLUSH", size_of::<FlushIn>(), 0, 0),
            Opcode::Init => info("INIT", size_of::<InitIn>(), size_of::<InitOut>(), 0),
            Opcode::OpenDir => info("OPENDIR", size_of::<OpenIn>(), size_of::<OpenOut>(), 0),
            Opcode::ReadDir => info("READDIR", size_of::<ReadIn>(), 0, 0),
            Opcode::ReleaseDir => info("RELEASEDIR", size_of::<ReleaseIn>(), 0, 0),
            Opcode::FsyncDir => info("FSYNCDIR", size_of::<FsyncIn>(), 0, 0),
            Opcode::GetLk => info("GETLK", size_of::<LkIn>(), size_of::<LkOut>(), 0),
            Opcode::SetLk => info("SETLK", size_of::<LkIn>(), 0, 0),
            Opcode::SetLkw => info("SETLKW", size_of::<LkIn>(), 0, 0),
            Opcode::Access => info("ACCESS", size_of::<AccessIn>(), 0, 0),
            Opcode::Create => info("CREATE", size_of::<CreateIn>(), size_of::<CreateOut>(), 1),
            Opcode::Interrupt => info("INTERRUPT", size_of::<InterruptIn>(), 0, 0),
            Opcode::Bmap => info("BMAP", size_of::<BmapIn>(), size_of::<BmapOut>(), 0),
            Opcode::Destroy => info("DESTROY", 0, 0, 0),
            Opcode::Ioctl => info("IOCTL", size_of::<IoctlIn>(), size_of::<IoctlOut>(), 0),
            Opcode::Poll => info("POLL", size_of::<PollIn>(), size_of::<PollOut>(), 0),
            Opcode::NotifyReply => info("NOTIFY_REPLY", 0, 0, 0),
            Opcode::BatchForget => info("BATCH_FORGET", size_of::<BatchForgetIn>(), 0, 0),
        }
    }

    pub fn name(self) -> &'static str {
        self.info().name
    }

    /// The kernel does not wait for a reply to these.
    pub fn expects_reply(self) -> bool {
        !matches!(
            self,
            Opcode::Forget | Opcode::BatchForget | Opcode::Interrupt | Opcode::NotifyReply
        )
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Human readable name for a raw opcode, including unknown ones.
pub fn operation_name(opcode: u32) -> String {
    match Opcode::from_u32(opcode) {
        Some(op) => op.name().to_string(),
        None => format!("OPCODE-{}", opcode),
    }
}
