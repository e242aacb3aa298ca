use std::fmt;
use std::io;

/// POSIX result code carried in every reply header.
///
/// Backends return these verbatim; the engine never rewrites a backend's
/// status on the way to the kernel.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status(pub i32);

impl Status {
    pub const OK: Status = Status(0);
    pub const EACCES: Status = Status(libc::EACCES);
    pub const EBADF: Status = Status(libc::EBADF);
    pub const EBUSY: Status = Status(libc::EBUSY);
    pub const EEXIST: Status = Status(libc::EEXIST);
    pub const EINVAL: Status = Status(libc::EINVAL);
    pub const EIO: Status = Status(libc::EIO);
    pub const EISDIR: Status = Status(libc::EISDIR);
    pub const ENODATA: Status = Status(libc::ENODATA);
    pub const ENODEV: Status = Status(libc::ENODEV);
    pub const ENOENT: Status = Status(libc::ENOENT);
    pub const ENOSYS: Status = Status(libc::ENOSYS);
    pub const ENOTDIR: Status = Status(libc::ENOTDIR);
    pub const ENOTEMPTY: Status = Status(libc::ENOTEMPTY);
    pub const EPERM: Status = Status(libc::EPERM);
    pub const ERANGE: Status = Status(libc::ERANGE);
    pub const EROFS: Status = Status(libc::EROFS);
    pub const EXDEV: Status = Status(libc::EXDEV);

    pub fn ok(self) -> bool {
        self.0 == 0
    }

    /// Converts to a `Result`, so backends can use `?` on statuses.
    pub fn into_result(self) -> Result<(), Status> {
        if self.ok() {
            Ok(())
        } else {
            Err(self)
        }
    }

    /// Value placed in `OutHeader::status`.
    pub fn wire_value(self) -> i32 {
        -self.0
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ok() {
            return write!(f, "OK");
        }
        write!(f, "{} ({})", self.0, io::Error::from_raw_os_error(self.0))
    }
}

impl From<io::Error> for Status {
    fn from(e: io::Error) -> Self {
        Status(io_error_to_errno(&e))
    }
}

impl From<nix::Error> for Status {
    fn from(e: nix::Error) -> Self {
        Status(e as i32)
    }
}

/// Errno for an I/O error, falling back on its kind when the OS gave none.
fn io_error_to_errno(e: &io::Error) -> i32 {
    if let Some(code) = e.raw_os_error() {
        return code;
    }

    match e.kind() {
        io::ErrorKind::NotFound => libc::ENOENT,
        io::ErrorKind::PermissionDenied => libc::EACCES,
        io::ErrorKind::AlreadyExists => libc::EEXIST,
        io::ErrorKind::InvalidInput => libc::EINVAL,
        io::ErrorKind::InvalidData => libc::EINVAL,
        io::ErrorKind::TimedOut => libc::ETIMEDOUT,
        io::ErrorKind::Interrupted => libc::EINTR,
        io::ErrorKind::WriteZero => libc::ENOSPC,
        io::ErrorKind::OutOfMemory => libc::ENOMEM,
        io::ErrorKind::BrokenPipe => libc::EPIPE,
        io::ErrorKind::WouldBlock => libc::EAGAIN,
        io::ErrorKind::Unsupported => libc::ENOSYS,
        _ => libc::EIO,
    }
}
