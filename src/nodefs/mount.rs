use std::fmt;
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::RwLock;

use crate::config::FileSystemOptions;
use crate::handle::{HandleMap, HandleSlot, Handled};
use crate::nodefs::dir::DirStream;
use crate::nodefs::inode::Inode;
use crate::nodefs::{File, NodeFileSystem};
use crate::raw::{Attr, AttrOut, EntryOut, S_IFDIR, S_IFMT};

/// A filesystem grafted into the tree, either at the root or below an
/// inode of another mount.
pub struct FileSystemMount {
    fs: Arc<dyn NodeFileSystem>,
    root: OnceLock<Weak<Inode>>,
    /// The inode this mount hangs under; `None` for the top-level mount.
    parent: Option<Weak<Inode>>,
    pub(crate) options: FileSystemOptions,
    /// Guards the shape of this mount's part of the tree.
    pub(crate) tree_lock: RwLock<()>,
    /// Shared by open and release, exclusive while unmount checks for open
    /// files. Independent of `tree_lock`.
    pub(crate) files_lock: RwLock<()>,
    pub(crate) open_files: HandleMap<OpenedFile>,
}

impl fmt::Debug for FileSystemMount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileSystemMount")
            .field("fs", &self.fs.name())
            .field("open_files", &self.open_files.count())
            .finish()
    }
}

impl FileSystemMount {
    pub(crate) fn new(
        fs: Arc<dyn NodeFileSystem>,
        options: FileSystemOptions,
        parent: Option<&Arc<Inode>>,
    ) -> Arc<Self> {
        Arc::new(FileSystemMount {
            fs,
            root: OnceLock::new(),
            parent: parent.map(Arc::downgrade),
            options,
            tree_lock: RwLock::new(()),
            files_lock: RwLock::new(()),
            open_files: HandleMap::new(),
        })
    }

    pub(crate) fn set_root(&self, root: &Arc<Inode>) {
        let _ = self.root.set(Arc::downgrade(root));
    }

    pub fn root(&self) -> Option<Arc<Inode>> {
        self.root.get().and_then(Weak::upgrade)
    }

    pub fn parent(&self) -> Option<Arc<Inode>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    pub fn fs(&self) -> &Arc<dyn NodeFileSystem> {
        &self.fs
    }

    pub fn options(&self) -> &FileSystemOptions {
        &self.options
    }

    pub fn open_file_count(&self) -> usize {
        self.open_files.count()
    }

    fn set_owner(&self, attr: &mut Attr) {
        if let Some(owner) = &self.options.owner {
            attr.uid = owner.uid;
            attr.gid = owner.gid;
        }
    }

    pub(crate) fn fill_entry(&self, out: &mut EntryOut) {
        (out.entry_valid, out.entry_valid_nsec) = split_duration(self.options.entry_timeout);
        (out.attr_valid, out.attr_valid_nsec) = split_duration(self.options.attr_timeout);
        self.set_owner(&mut out.attr);
        if out.attr.mode & S_IFMT != S_IFDIR && out.attr.nlink == 0 {
            out.attr.nlink = 1;
        }
    }

    /// A cacheable "does not exist" answer.
    pub(crate) fn fill_negative_entry(&self, out: &mut EntryOut) {
        out.node_id = 0;
        (out.entry_valid, out.entry_valid_nsec) = split_duration(self.options.negative_timeout);
    }

    pub(crate) fn fill_attr(&self, out: &mut AttrOut, node_id: u64) {
        (out.attr_valid, out.attr_valid_nsec) = split_duration(self.options.attr_timeout);
        self.set_owner(&mut out.attr);
        out.attr.ino = node_id;
    }

    /// Record an open file or directory on `node` and hand out its handle.
    pub(crate) fn register_file(
        &self,
        node: &Arc<Inode>,
        kind: OpenedKind,
        open_flags: u32,
    ) -> (u64, Arc<OpenedFile>) {
        let fuse_flags = match &kind {
            OpenedKind::File(f) => f.open_flags(),
            OpenedKind::Dir(_) => 0,
        };
        let opened = Arc::new(OpenedFile {
            slot: HandleSlot::new(),
            kind,
            open_flags,
            fuse_flags,
        });
        let _guard = self.files_lock.read();
        let fh = self.open_files.register(&opened);
        node.open_files.lock().push(opened.clone());
        (fh, opened)
    }

    pub(crate) fn unregister_file(&self, node: &Inode, fh: u64) -> Arc<OpenedFile> {
        let _guard = self.files_lock.read();
        let opened = self
            .open_files
            .forget(fh)
            .unwrap_or_else(|err| panic!("release of file handle: {}", err));
        let mut files = node.open_files.lock();
        if let Some(pos) = files.iter().position(|f| Arc::ptr_eq(f, &opened)) {
            files.swap_remove(pos);
        }
        opened
    }

    pub(crate) fn opened_file(&self, fh: u64) -> Arc<OpenedFile> {
        self.open_files
            .decode(fh)
            .unwrap_or_else(|err| panic!("file handle from kernel: {}", err))
    }
}

pub(crate) enum OpenedKind {
    File(Box<dyn File>),
    Dir(DirStream),
}

/// An open file or directory, as known by its kernel file handle.
pub struct OpenedFile {
    slot: HandleSlot,
    kind: OpenedKind,
    /// Flags the file was opened with.
    pub open_flags: u32,
    /// FOPEN_* flags reported back to the kernel.
    pub fuse_flags: u32,
}

impl Handled for OpenedFile {
    fn handle_slot(&self) -> &HandleSlot {
        &self.slot
    }
}

impl OpenedFile {
    pub fn file(&self) -> Option<&dyn File> {
        match &self.kind {
            OpenedKind::File(f) => Some(f.as_ref()),
            OpenedKind::Dir(_) => None,
        }
    }

    pub(crate) fn dir(&self) -> Option<&DirStream> {
        match &self.kind {
            OpenedKind::Dir(d) => Some(d),
            OpenedKind::File(_) => None,
        }
    }
}

/// Seconds as whole seconds and nanoseconds.
fn split_duration(secs: f64) -> (u64, u32) {
    if !secs.is_finite() || secs <= 0.0 {
        return (0, 0);
    }
    let whole = secs.trunc();
    (whole as u64, ((secs - whole) * 1e9) as u32)
}
