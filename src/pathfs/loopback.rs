use std::fs::{self, DirBuilder, OpenOptions, Permissions};
use std::os::unix::ffi::OsStringExt;
use std::os::unix::fs::{DirBuilderExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use nix::sys::stat::{Mode, SFlag, UtimensatFlags};
use nix::sys::time::TimeSpec;
use nix::unistd::AccessFlags;

use crate::nodefs::{DirEntry, File, LoopbackFile};
use crate::pathfs::PathFileSystem;
use crate::raw::{attr_from_metadata, Attr, Kstatfs, Status, S_IFMT};
use crate::request::Context;

/// A [`PathFileSystem`] passing every operation through to a directory of
/// the host filesystem.
#[derive(Debug, Clone)]
pub struct LoopbackFileSystem {
    root: PathBuf,
}

impl LoopbackFileSystem {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LoopbackFileSystem { root: root.into() }
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    fn full_path(&self, name: &str) -> PathBuf {
        if name.is_empty() {
            self.root.clone()
        } else {
            self.root.join(name)
        }
    }
}

fn io_status(result: std::io::Result<()>) -> Status {
    match result {
        Ok(()) => Status::OK,
        Err(e) => Status::from(e),
    }
}

fn nix_status(result: nix::Result<()>) -> Status {
    match result {
        Ok(()) => Status::OK,
        Err(e) => Status::from(e),
    }
}

/// Open options for kernel open flags. The access mode selects read/write,
/// everything else is passed through.
fn open_options(flags: u32) -> OpenOptions {
    let flags = flags as i32;
    let mut opts = OpenOptions::new();
    match flags & libc::O_ACCMODE {
        libc::O_WRONLY => opts.write(true),
        libc::O_RDWR => opts.read(true).write(true),
        _ => opts.read(true),
    };
    opts.custom_flags(flags & !libc::O_ACCMODE);
    opts
}

impl PathFileSystem for LoopbackFileSystem {
    fn name(&self) -> String {
        format!("loopback({})", self.root.display())
    }

    fn get_attr(&self, name: &str, _ctx: &Context) -> Result<Attr, Status> {
        let meta = fs::symlink_metadata(self.full_path(name))?;
        Ok(attr_from_metadata(&meta))
    }

    fn open_dir(&self, name: &str, _ctx: &Context) -> Result<Vec<DirEntry>, Status> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(self.full_path(name))? {
            let entry = entry?;
            let Ok(entry_name) = entry.file_name().into_string() else {
                tracing::warn!("Skipping non UTF-8 name in {:?}", name);
                continue;
            };
            let mode = match entry.metadata() {
                Ok(meta) => meta.mode(),
                // Raced with a removal.
                Err(_) => continue,
            };
            entries.push(DirEntry::new(entry_name, mode));
        }
        Ok(entries)
    }

    fn open(&self, name: &str, flags: u32, _ctx: &Context) -> Result<Box<dyn File>, Status> {
        let file = open_options(flags).open(self.full_path(name))?;
        Ok(Box::new(LoopbackFile::new(file)))
    }

    fn create(&self, name: &str, flags: u32, mode: u32, _ctx: &Context) -> Result<Box<dyn File>, Status> {
        let mut opts = open_options(flags);
        opts.custom_flags((flags as i32 & !libc::O_ACCMODE) | libc::O_CREAT)
            .mode(mode & 0o7777);
        let file = opts.open(self.full_path(name))?;
        Ok(Box::new(LoopbackFile::new(file)))
    }

    fn chmod(&self, name: &str, mode: u32, _ctx: &Context) -> Status {
        io_status(fs::set_permissions(
            self.full_path(name),
            Permissions::from_mode(mode & 0o7777),
        ))
    }

    fn chown(&self, name: &str, uid: Option<u32>, gid: Option<u32>, _ctx: &Context) -> Status {
        io_status(std::os::unix::fs::lchown(self.full_path(name), uid, gid))
    }

    fn truncate(&self, name: &str, size: u64, _ctx: &Context) -> Status {
        let Ok(size) = libc::off_t::try_from(size) else {
            return Status::EINVAL;
        };
        nix_status(nix::unistd::truncate(&self.full_path(name), size))
    }

    fn utimens(
        &self,
        name: &str,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
        _ctx: &Context,
    ) -> Status {
        let (Some(atime), Some(mtime)) = (time_spec(atime), time_spec(mtime)) else {
            return Status::EINVAL;
        };
        nix_status(nix::sys::stat::utimensat(
            None,
            &self.full_path(name),
            &atime,
            &mtime,
            UtimensatFlags::NoFollowSymlink,
        ))
    }

    fn access(&self, name: &str, mask: u32, _ctx: &Context) -> Status {
        let flags = AccessFlags::from_bits_truncate(mask as libc::c_int);
        nix_status(nix::unistd::access(&self.full_path(name), flags))
    }

    fn link(&self, old_name: &str, new_name: &str, _ctx: &Context) -> Status {
        io_status(fs::hard_link(self.full_path(old_name), self.full_path(new_name)))
    }

    fn mkdir(&self, name: &str, mode: u32, _ctx: &Context) -> Status {
        io_status(
            DirBuilder::new()
                .mode(mode & 0o7777)
                .create(self.full_path(name)),
        )
    }

    fn mknod(&self, name: &str, mode: u32, dev: u32, _ctx: &Context) -> Status {
        let kind = SFlag::from_bits_truncate(mode & S_IFMT);
        let perm = Mode::from_bits_truncate(mode & 0o7777);
        nix_status(nix::sys::stat::mknod(
            &self.full_path(name),
            kind,
            perm,
            libc::dev_t::from(dev),
        ))
    }

    fn rename(&self, old_name: &str, new_name: &str, _ctx: &Context) -> Status {
        io_status(fs::rename(self.full_path(old_name), self.full_path(new_name)))
    }

    fn rmdir(&self, name: &str, _ctx: &Context) -> Status {
        io_status(fs::remove_dir(self.full_path(name)))
    }

    fn unlink(&self, name: &str, _ctx: &Context) -> Status {
        io_status(fs::remove_file(self.full_path(name)))
    }

    fn symlink(&self, value: &str, link_name: &str, _ctx: &Context) -> Status {
        io_status(std::os::unix::fs::symlink(value, self.full_path(link_name)))
    }

    fn readlink(&self, name: &str, _ctx: &Context) -> Result<Vec<u8>, Status> {
        let target = fs::read_link(self.full_path(name))?;
        Ok(target.into_os_string().into_vec())
    }

    fn get_xattr(&self, name: &str, attr: &str, _ctx: &Context) -> Result<Vec<u8>, Status> {
        match xattr::get(self.full_path(name), attr)? {
            Some(value) => Ok(value),
            None => Err(Status::ENODATA),
        }
    }

    fn list_xattr(&self, name: &str, _ctx: &Context) -> Result<Vec<String>, Status> {
        let attrs = xattr::list(self.full_path(name))?;
        Ok(attrs
            .filter_map(|attr| attr.into_string().ok())
            .collect())
    }

    /// The create/replace flags are not honored.
    fn set_xattr(&self, name: &str, attr: &str, data: &[u8], _flags: u32, _ctx: &Context) -> Status {
        io_status(xattr::set(self.full_path(name), attr, data))
    }

    fn remove_xattr(&self, name: &str, attr: &str, _ctx: &Context) -> Status {
        io_status(xattr::remove(self.full_path(name), attr))
    }

    fn statfs(&self, name: &str) -> Result<Kstatfs, Status> {
        let st = nix::sys::statvfs::statvfs(&self.full_path(name))?;
        Ok(Kstatfs {
            blocks: st.blocks() as u64,
            bfree: st.blocks_free() as u64,
            bavail: st.blocks_available() as u64,
            files: st.files() as u64,
            ffree: st.files_free() as u64,
            bsize: st.block_size() as u32,
            namelen: st.name_max() as u32,
            frsize: st.fragment_size() as u32,
            ..Default::default()
        })
    }
}

/// Timestamp for `utimensat`; an absent time leaves the field unchanged.
fn time_spec(time: Option<SystemTime>) -> Option<TimeSpec> {
    match time {
        None => Some(TimeSpec::UTIME_OMIT),
        Some(t) => t.duration_since(UNIX_EPOCH).ok().map(TimeSpec::from),
    }
}
