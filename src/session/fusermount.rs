//! Mounting through the setuid `fusermount` helper.
//!
//! The helper opens `/dev/fuse`, performs the mount, and passes the device
//! descriptor back over the unix socket named by `_FUSE_COMMFD`.

use std::fs;
use std::io::IoSliceMut;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::OnceLock;
use std::thread;
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::socket::{
    recvmsg, socketpair, AddressFamily, ControlMessageOwned, MsgFlags, SockFlag, SockType,
};

use crate::config::MountOptions;
use crate::error::{FuseError, Result};

const UNMOUNT_ATTEMPTS: u32 = 5;

static FUSERMOUNT: OnceLock<Option<PathBuf>> = OnceLock::new();

/// Location of the helper binary, searched for once in `PATH`.
pub fn fusermount_binary() -> Option<&'static Path> {
    FUSERMOUNT
        .get_or_init(|| find_in_path("fusermount").or_else(|| find_in_path("fusermount3")))
        .as_deref()
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// The `-o` argument for the helper.
pub fn mount_option_string(options: &MountOptions) -> String {
    let mut opts = Vec::new();
    if options.allow_other {
        opts.push("allow_other".to_string());
    }
    if !options.fs_name.is_empty() {
        opts.push(format!("fsname={}", options.fs_name));
    }
    opts.extend(options.options.iter().cloned());
    opts.join(",")
}

/// Mount at `mount_point` and return the kernel channel.
pub fn mount(mount_point: &Path, options: &MountOptions) -> Result<fs::File> {
    let bin = fusermount_binary()
        .ok_or_else(|| FuseError::Mount("fusermount not found in PATH".to_string()))?;

    let (local, remote) = socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::SOCK_CLOEXEC,
    )?;
    // The helper inherits its end of the pair.
    fcntl(remote.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::empty()))?;

    let mut cmd = Command::new(bin);
    let opts = mount_option_string(options);
    if !opts.is_empty() {
        cmd.arg("-o").arg(&opts);
    }
    cmd.arg("--")
        .arg(mount_point)
        .env("_FUSE_COMMFD", remote.as_raw_fd().to_string())
        .stdin(Stdio::null());

    tracing::debug!("Running {} -o {} -- {}", bin.display(), opts, mount_point.display());
    let output = cmd.output()?;
    drop(remote);

    if !output.status.success() {
        return Err(FuseError::Mount(format!(
            "fusermount failed for {}: {}",
            mount_point.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    let fd = receive_fd(local.as_raw_fd())?;
    Ok(fs::File::from(fd))
}

/// Receive one descriptor sent with SCM_RIGHTS.
fn receive_fd(socket: RawFd) -> Result<OwnedFd> {
    let mut buffer = [0u8; 1];
    let mut cmsg_buffer = nix::cmsg_space!(RawFd);

    let (received, fd) = loop {
        let mut iov = [IoSliceMut::new(&mut buffer)];
        match recvmsg::<()>(socket, &mut iov, Some(&mut cmsg_buffer), MsgFlags::empty()) {
            Ok(msg) => {
                let fd = msg.cmsgs()?.find_map(|cmsg| match cmsg {
                    ControlMessageOwned::ScmRights(fds) => fds.first().copied(),
                    _ => None,
                });
                break (msg.bytes, fd);
            }
            Err(Errno::EINTR) => continue,
            Err(err) => return Err(err.into()),
        }
    };
    if received == 0 {
        return Err(FuseError::Mount(
            "fusermount closed the socket without sending a descriptor".to_string(),
        ));
    }
    let fd = fd.ok_or_else(|| FuseError::Mount("no descriptor from fusermount".to_string()))?;
    // SCM_RIGHTS installed a fresh descriptor that nothing else owns.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Unmount `mount_point`, retrying while it is busy.
pub fn unmount(mount_point: &Path) -> Result<()> {
    let mut delay = Duration::from_millis(5);
    let mut last_error = String::new();

    for attempt in 1..=UNMOUNT_ATTEMPTS {
        let output = match fusermount_binary() {
            Some(bin) => Command::new(bin).arg("-u").arg(mount_point).output()?,
            None => Command::new("umount").arg(mount_point).output()?,
        };
        if output.status.success() {
            return Ok(());
        }

        last_error = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if !last_error.contains("busy") {
            break;
        }
        tracing::debug!(
            "Unmount of {} busy (attempt {}), retrying in {:?}",
            mount_point.display(),
            attempt,
            delay
        );
        thread::sleep(delay);
        delay *= 2;
    }

    if last_error.contains("busy") {
        return Err(FuseError::Busy(mount_point.to_path_buf()));
    }
    Err(FuseError::Mount(format!(
        "unmount of {} failed: {}",
        mount_point.display(),
        last_error
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mount_option_string() {
        let options = MountOptions {
            allow_other: true,
            fs_name: "loop".to_string(),
            options: vec!["ro".to_string()],
            ..Default::default()
        };
        assert_eq!(mount_option_string(&options), "allow_other,fsname=loop,ro");
    }

    fn pair() -> (OwnedFd, OwnedFd) {
        socketpair(AddressFamily::Unix, SockType::Stream, None, SockFlag::SOCK_CLOEXEC).unwrap()
    }

    #[test]
    fn test_receive_fd_over_socket() {
        use nix::sys::socket::{sendmsg, ControlMessage};
        use std::io::{IoSlice, Read, Seek, Write};

        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("dev");
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap();

        let (local, remote) = pair();
        let fds = [file.as_raw_fd()];
        sendmsg::<()>(
            remote.as_raw_fd(),
            &[IoSlice::new(b"\0")],
            &[ControlMessage::ScmRights(&fds)],
            MsgFlags::empty(),
            None,
        )
        .unwrap();
        drop(file);

        let mut received = fs::File::from(receive_fd(local.as_raw_fd()).unwrap());
        received.write_all(b"channel").unwrap();
        received.rewind().unwrap();
        let mut contents = String::new();
        received.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "channel");
        assert_eq!(fs::read(&path).unwrap(), b"channel");
    }

    #[test]
    fn test_receive_fd_without_descriptor() {
        use std::io::Write;

        let (local, remote) = pair();
        let mut remote = std::os::unix::net::UnixStream::from(remote);
        remote.write_all(b"x").unwrap();
        assert!(matches!(receive_fd(local.as_raw_fd()), Err(FuseError::Mount(_))));

        drop(remote);
        assert!(matches!(receive_fd(local.as_raw_fd()), Err(FuseError::Mount(_))));
    }

    #[test]
    fn test_missing_binary_is_not_found() {
        assert!(find_in_path("definitely-not-a-fusermount-binary").is_none());
    }
}
