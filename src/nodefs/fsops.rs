//! Kernel operations on the inode tree.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::nodefs::dir::{DirEntry, DirStream};
use crate::nodefs::inode::Inode;
use crate::nodefs::mount::{OpenedFile, OpenedKind};
use crate::nodefs::{File, FileSystemConnector};
use crate::raw::*;
use crate::rawfs::RawFileSystem;
use crate::request::Context;
use crate::session::Notifier;

impl FileSystemConnector {
    /// Count a freshly created or linked child and describe it to the kernel.
    fn fill_new_entry(&self, child: &Arc<Inode>, attr: Attr, out: &mut EntryOut) {
        let node_id = self.lookup_update(child);
        out.node_id = node_id;
        out.generation = 1;
        out.attr = attr;
        out.attr.ino = node_id;
        child.mount().fill_entry(out);
    }

    fn entry_reply(&self, result: Result<(Arc<Inode>, Attr), Status>, out: &mut EntryOut) -> Status {
        match result {
            Ok((child, attr)) => {
                self.fill_new_entry(&child, attr, out);
                Status::OK
            }
            Err(status) => status,
        }
    }

    /// `.` and `..`, the backend's names, then mounts grafted below `node`.
    fn list_dir(&self, node: &Arc<Inode>, ctx: &Context) -> Result<Vec<DirEntry>, Status> {
        let mut entries = vec![DirEntry::new(".", S_IFDIR), DirEntry::new("..", S_IFDIR)];
        entries.extend(
            node.node()
                .open_dir(ctx)?
                .into_iter()
                .filter(|e| e.name != "." && e.name != ".."),
        );
        for name in node.mount_names() {
            if !entries.iter().any(|e| e.name == name) {
                entries.push(DirEntry::new(name, S_IFDIR));
            }
        }
        Ok(entries)
    }

    /// Attributes from the open file when there is one, else from the node.
    fn node_attr(&self, node: &Inode, file: Option<&dyn File>, ctx: &Context) -> Result<Attr, Status> {
        if let Some(file) = file {
            match file.get_attr() {
                Err(Status::ENOSYS) => {}
                result => return result,
            }
        }
        node.node().get_attr(ctx)
    }
}

/// Run `on_file` when an open file is at hand, falling back to `on_node`
/// when there is none or it does not implement the operation.
fn file_first(
    file: Option<&dyn File>,
    on_file: impl FnOnce(&dyn File) -> Status,
    on_node: impl FnOnce() -> Status,
) -> Status {
    match file.map(on_file) {
        Some(Status::ENOSYS) | None => on_node(),
        Some(status) => status,
    }
}

fn timestamp(secs: u64, nsecs: u32) -> SystemTime {
    UNIX_EPOCH + Duration::new(secs, nsecs)
}

impl RawFileSystem for FileSystemConnector {
    fn init(&self, notifier: Notifier) {
        self.set_notifier(Some(notifier));
    }

    fn destroy(&self) {
        self.set_notifier(None);
    }

    fn lookup(&self, header: &InHeader, name: &str, out: &mut EntryOut) -> Status {
        let parent = self.to_inode(header.node_id);
        if !parent.is_dir() {
            return Status::ENOTDIR;
        }
        let ctx = Context::from(header);
        match self.internal_lookup(&parent, name, &ctx) {
            Ok((child, node_id, attr)) => {
                out.node_id = node_id;
                out.generation = 1;
                out.attr = attr;
                out.attr.ino = node_id;
                child.mount().fill_entry(out);
                Status::OK
            }
            Err(Status::ENOENT) if parent.mount().options.negative_timeout > 0.0 => {
                parent.mount().fill_negative_entry(out);
                Status::OK
            }
            Err(status) => status,
        }
    }

    fn forget(&self, node_id: u64, nlookup: u64) {
        if node_id == FUSE_ROOT_ID {
            return;
        }
        let node = self.to_inode(node_id);
        self.forget_update(&node, nlookup);
    }

    fn getattr(&self, header: &InHeader, input: &GetAttrIn, out: &mut AttrOut) -> Status {
        let node = self.to_inode(header.node_id);
        let opened = (input.getattr_flags & FUSE_GETATTR_FH != 0)
            .then(|| node.mount().opened_file(input.fh));
        let file = opened.as_deref().and_then(OpenedFile::file);

        match self.node_attr(&node, file, &Context::from(header)) {
            Ok(attr) => {
                out.attr = attr;
                node.mount().fill_attr(out, header.node_id);
                Status::OK
            }
            Err(status) => status,
        }
    }

    fn setattr(&self, header: &InHeader, input: &SetAttrIn, out: &mut AttrOut) -> Status {
        let node = self.to_inode(header.node_id);
        let ctx = Context::from(header);
        let opened = (input.valid & FATTR_FH != 0).then(|| node.mount().opened_file(input.fh));
        let file = opened.as_deref().and_then(OpenedFile::file);
        let fs = node.node();

        let mut code = Status::OK;
        if input.valid & FATTR_MODE != 0 {
            let perms = input.mode & 0o7777;
            code = file_first(file, |f| f.chmod(perms), || fs.chmod(perms, &ctx));
        }
        if code.ok() && input.valid & (FATTR_UID | FATTR_GID) != 0 {
            let uid = (input.valid & FATTR_UID != 0).then_some(input.uid);
            let gid = (input.valid & FATTR_GID != 0).then_some(input.gid);
            code = file_first(file, |f| f.chown(uid, gid), || fs.chown(uid, gid, &ctx));
        }
        if code.ok() && input.valid & FATTR_SIZE != 0 {
            code = file_first(file, |f| f.truncate(input.size), || fs.truncate(input.size, &ctx));
        }
        let time_bits = FATTR_ATIME | FATTR_MTIME | FATTR_ATIME_NOW | FATTR_MTIME_NOW;
        if code.ok() && input.valid & time_bits != 0 {
            let now = SystemTime::now();
            let atime = (input.valid & FATTR_ATIME != 0).then(|| {
                if input.valid & FATTR_ATIME_NOW != 0 {
                    now
                } else {
                    timestamp(input.atime, input.atimensec)
                }
            });
            let mtime = (input.valid & FATTR_MTIME != 0).then(|| {
                if input.valid & FATTR_MTIME_NOW != 0 {
                    now
                } else {
                    timestamp(input.mtime, input.mtimensec)
                }
            });
            code = file_first(file, |f| f.utimens(atime, mtime), || fs.utimens(atime, mtime, &ctx));
        }
        if !code.ok() {
            return code;
        }

        // The filesystem may not have applied everything as asked.
        match self.node_attr(&node, file, &ctx) {
            Ok(attr) => {
                out.attr = attr;
                node.mount().fill_attr(out, header.node_id);
                Status::OK
            }
            Err(status) => status,
        }
    }

    fn readlink(&self, header: &InHeader) -> Result<Vec<u8>, Status> {
        let node = self.to_inode(header.node_id);
        node.node().readlink(&Context::from(header))
    }

    fn mknod(&self, header: &InHeader, input: &MknodIn, name: &str, out: &mut EntryOut) -> Status {
        let parent = self.to_inode(header.node_id);
        let ctx = Context::from(header);
        let result = parent.node().mknod(&parent, name, input.mode, input.rdev, &ctx);
        self.entry_reply(result, out)
    }

    fn mkdir(&self, header: &InHeader, input: &MkdirIn, name: &str, out: &mut EntryOut) -> Status {
        let parent = self.to_inode(header.node_id);
        let ctx = Context::from(header);
        let result = parent.node().mkdir(&parent, name, input.mode, &ctx);
        self.entry_reply(result, out)
    }

    fn unlink(&self, header: &InHeader, name: &str) -> Status {
        let parent = self.to_inode(header.node_id);
        let code = parent.node().unlink(&parent, name, &Context::from(header));
        if code.ok() {
            parent.rm_child(name);
        }
        code
    }

    fn rmdir(&self, header: &InHeader, name: &str) -> Status {
        let parent = self.to_inode(header.node_id);
        let code = parent.node().rmdir(&parent, name, &Context::from(header));
        if code.ok() {
            parent.rm_child(name);
        }
        code
    }

    fn symlink(&self, header: &InHeader, name: &str, target: &str, out: &mut EntryOut) -> Status {
        let parent = self.to_inode(header.node_id);
        let ctx = Context::from(header);
        let result = parent.node().symlink(&parent, name, target, &ctx);
        self.entry_reply(result, out)
    }

    fn rename(&self, header: &InHeader, input: &RenameIn, old_name: &str, new_name: &str) -> Status {
        let old_parent = self.to_inode(header.node_id);
        let new_parent = self.to_inode(input.newdir);
        if !Arc::ptr_eq(old_parent.mount(), new_parent.mount()) {
            return Status::EXDEV;
        }
        if old_parent.find_mount(old_name).is_some() || new_parent.find_mount(new_name).is_some() {
            return Status::EBUSY;
        }

        let ctx = Context::from(header);
        let code = old_parent
            .node()
            .rename(&old_parent, old_name, &new_parent, new_name, &ctx);
        if code.ok() {
            let _guard = old_parent.mount().tree_lock.write();
            if let Some(child) = old_parent.rm_child_locked(old_name) {
                new_parent.rm_child_locked(new_name);
                new_parent.add_child_locked(new_name, &child);
            }
        }
        code
    }

    fn link(&self, header: &InHeader, input: &LinkIn, name: &str, out: &mut EntryOut) -> Status {
        let parent = self.to_inode(header.node_id);
        let existing = self.to_inode(input.oldnodeid);
        if !Arc::ptr_eq(parent.mount(), existing.mount()) {
            return Status::EXDEV;
        }
        let ctx = Context::from(header);
        let result = parent.node().link(&parent, name, &existing, &ctx);
        self.entry_reply(result, out)
    }

    fn getxattr(&self, header: &InHeader, attr: &str) -> Result<Vec<u8>, Status> {
        let node = self.to_inode(header.node_id);
        node.node().get_xattr(attr, &Context::from(header))
    }

    fn listxattr(&self, header: &InHeader) -> Result<Vec<u8>, Status> {
        let node = self.to_inode(header.node_id);
        let names = node.node().list_xattr(&Context::from(header))?;
        let mut out = Vec::new();
        for name in names {
            out.extend_from_slice(name.as_bytes());
            out.push(0);
        }
        Ok(out)
    }

    fn setxattr(&self, header: &InHeader, input: &SetXAttrIn, attr: &str, data: &[u8]) -> Status {
        let node = self.to_inode(header.node_id);
        node.node()
            .set_xattr(attr, data, input.flags, &Context::from(header))
    }

    fn removexattr(&self, header: &InHeader, attr: &str) -> Status {
        let node = self.to_inode(header.node_id);
        node.node().remove_xattr(attr, &Context::from(header))
    }

    fn access(&self, header: &InHeader, input: &AccessIn) -> Status {
        let node = self.to_inode(header.node_id);
        node.node().access(input.mask, &Context::from(header))
    }

    fn create(&self, header: &InHeader, input: &CreateIn, name: &str, out: &mut CreateOut) -> Status {
        let parent = self.to_inode(header.node_id);
        let ctx = Context::from(header);
        match parent
            .node()
            .create(&parent, name, input.flags, input.mode, &ctx)
        {
            Ok((file, child, attr)) => {
                self.fill_new_entry(&child, attr, &mut out.entry);
                let (fh, opened) =
                    child
                        .mount()
                        .register_file(&child, OpenedKind::File(file), input.flags);
                out.open.fh = fh;
                out.open.open_flags = opened.fuse_flags;
                Status::OK
            }
            Err(status) => status,
        }
    }

    fn open(&self, header: &InHeader, input: &OpenIn, out: &mut OpenOut) -> Status {
        let node = self.to_inode(header.node_id);
        match node.node().open(input.flags, &Context::from(header)) {
            Ok(file) => {
                let (fh, opened) = node
                    .mount()
                    .register_file(&node, OpenedKind::File(file), input.flags);
                out.fh = fh;
                out.open_flags = opened.fuse_flags;
                Status::OK
            }
            Err(status) => status,
        }
    }

    fn read(&self, header: &InHeader, input: &ReadIn, buf: &mut [u8]) -> Result<usize, Status> {
        let node = self.to_inode(header.node_id);
        let opened = node.mount().opened_file(input.fh);
        let file = opened.file().ok_or(Status::EISDIR)?;
        file.read(buf, input.offset)
    }

    fn write(&self, header: &InHeader, input: &WriteIn, data: &[u8]) -> Result<u32, Status> {
        let node = self.to_inode(header.node_id);
        let opened = node.mount().opened_file(input.fh);
        let file = opened.file().ok_or(Status::EISDIR)?;
        file.write(data, input.offset)
    }

    fn release(&self, header: &InHeader, input: &ReleaseIn) {
        let node = self.to_inode(header.node_id);
        let opened = node.mount().unregister_file(&node, input.fh);
        if let Some(file) = opened.file() {
            file.release();
        }
        if node.lookup_count() == 0 {
            self.consider_drop(&node);
        }
    }

    fn flush(&self, header: &InHeader, input: &FlushIn) -> Status {
        let node = self.to_inode(header.node_id);
        let opened = node.mount().opened_file(input.fh);
        opened.file().map_or(Status::OK, |f| f.flush())
    }

    fn fsync(&self, header: &InHeader, input: &FsyncIn) -> Status {
        let node = self.to_inode(header.node_id);
        let opened = node.mount().opened_file(input.fh);
        opened
            .file()
            .map_or(Status::ENOSYS, |f| f.fsync(input.fsync_flags))
    }

    fn opendir(&self, header: &InHeader, input: &OpenIn, out: &mut OpenOut) -> Status {
        let node = self.to_inode(header.node_id);
        match self.list_dir(&node, &Context::from(header)) {
            Ok(entries) => {
                let (fh, _) = node.mount().register_file(
                    &node,
                    OpenedKind::Dir(DirStream::new(entries)),
                    input.flags,
                );
                out.fh = fh;
                Status::OK
            }
            Err(status) => status,
        }
    }

    fn readdir(&self, header: &InHeader, input: &ReadIn, out: &mut DirEntryList) -> Status {
        let node = self.to_inode(header.node_id);
        let opened = node.mount().opened_file(input.fh);
        let Some(dir) = opened.dir() else {
            return Status::ENOTDIR;
        };
        if dir.is_rewind(input.offset) {
            match self.list_dir(&node, &Context::from(header)) {
                Ok(entries) => dir.reset(entries),
                Err(status) => return status,
            }
        }
        dir.fill(input.offset, out);
        Status::OK
    }

    fn releasedir(&self, header: &InHeader, input: &ReleaseIn) {
        let node = self.to_inode(header.node_id);
        node.mount().unregister_file(&node, input.fh);
        if node.lookup_count() == 0 {
            self.consider_drop(&node);
        }
    }

    fn statfs(&self, header: &InHeader, out: &mut StatfsOut) -> Status {
        let node = self.to_inode(header.node_id);
        match node.node().statfs() {
            Ok(st) => {
                out.st = st;
                Status::OK
            }
            Err(status) => status,
        }
    }
}
