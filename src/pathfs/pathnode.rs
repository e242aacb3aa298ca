use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::SystemTime;

use fxhash::FxHashMap;
use parking_lot::{Mutex, RwLock};

use crate::config::PathNodeFsOptions;
use crate::nodefs::{DirEntry, File, FileSystemConnector, FsNode, Inode, NewEntry, NodeFileSystem};
use crate::pathfs::{join_path, PathFileSystem};
use crate::raw::{Attr, Kstatfs, Status, S_IFDIR, S_IFMT};
use crate::request::Context;

/// One known name of a backend inode.
struct ClientEntry {
    parent: Arc<PathInode>,
    name: String,
    node: Arc<PathInode>,
}

type ClientInodeMap = FxHashMap<u64, Vec<ClientEntry>>;

/// Serves a [`PathFileSystem`] as a node filesystem.
///
/// Each [`PathInode`] remembers its parent and name so the full path can be
/// rebuilt for every call into the backend. With `client_inodes` set, the
/// backend's inode numbers are used to give hard links a single in-memory
/// node.
pub struct PathNodeFs {
    me: Weak<PathNodeFs>,
    fs: Arc<dyn PathFileSystem>,
    root: Arc<PathInode>,
    connector: OnceLock<Weak<FileSystemConnector>>,
    /// Guards every node's location as well as the client inode map. Not
    /// held while taking a mount tree lock.
    path_lock: RwLock<ClientInodeMap>,
    options: PathNodeFsOptions,
}

impl PathNodeFs {
    pub fn new(fs: Arc<dyn PathFileSystem>, options: PathNodeFsOptions) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<PathNodeFs>| PathNodeFs {
            me: me.clone(),
            fs,
            root: PathInode::new(me.clone(), None, String::new()),
            connector: OnceLock::new(),
            path_lock: RwLock::new(FxHashMap::default()),
            options,
        })
    }

    pub fn fs(&self) -> &Arc<dyn PathFileSystem> {
        &self.fs
    }

    pub fn root(&self) -> &Arc<PathInode> {
        &self.root
    }

    pub fn options(&self) -> &PathNodeFsOptions {
        &self.options
    }

    pub fn connector(&self) -> Option<Arc<FileSystemConnector>> {
        self.connector.get().and_then(Weak::upgrade)
    }

    /// The inode at `path`, if the kernel has looked it up.
    pub fn node(&self, path: &str) -> Option<Arc<Inode>> {
        let connector = self.connector()?;
        let root = self.root.inode()?;
        let (node, rest) = connector.node(&root, path);
        rest.is_empty().then_some(node)
    }

    /// Drop the kernel's cached data for `path`.
    pub fn notify(&self, path: &str) -> Status {
        match (self.connector(), self.node(path)) {
            (Some(connector), Some(node)) => connector.inode_notify(&node, 0, 0),
            _ => Status::ENOENT,
        }
    }

    /// Drop the kernel's cached entry `name` in directory `dir`.
    pub fn entry_notify(&self, dir: &str, name: &str) -> Status {
        match (self.connector(), self.node(dir)) {
            (Some(connector), Some(node)) => connector.entry_notify(&node, name),
            _ => Status::ENOENT,
        }
    }

    /// Number of backend inodes with known names.
    pub fn client_inode_count(&self) -> usize {
        self.path_lock.read().len()
    }

    fn find_client_inode(&self, ino: u64) -> Option<Arc<PathInode>> {
        let clients = self.path_lock.read();
        clients.get(&ino)?.first().map(|e| e.node.clone())
    }

    fn add_client_entry(&self, ino: u64, parent: &Arc<PathInode>, name: &str, node: &Arc<PathInode>) {
        let mut clients = self.path_lock.write();
        let entries = clients.entry(ino).or_default();
        entries.retain(|e| !(Arc::ptr_eq(&e.parent, parent) && e.name == name));
        entries.push(ClientEntry {
            parent: parent.clone(),
            name: name.to_string(),
            node: node.clone(),
        });
    }

    /// `parent/name` no longer refers to `node`. Caller holds the path lock.
    fn unlinked_locked(clients: &mut ClientInodeMap, node: &PathInode, parent: &Arc<PathInode>, name: &str) {
        let ino = node.client_inode();
        let mut survivor = None;
        if let Some(entries) = clients.get_mut(&ino) {
            entries.retain(|e| !(Arc::ptr_eq(&e.parent, parent) && e.name == name));
            survivor = entries
                .iter()
                .find(|e| ptr::eq(Arc::as_ptr(&e.node), node))
                .map(|e| (e.parent.clone(), e.name.clone()));
            if entries.is_empty() {
                clients.remove(&ino);
            }
        }

        let mut loc = node.location.lock();
        if !loc.is_at(parent, name) {
            return;
        }
        match survivor {
            Some((new_parent, new_name)) => {
                tracing::debug!("{:?} removed, node now known as {:?}", name, new_name);
                loc.parent = Some(new_parent);
                loc.name = new_name;
            }
            None => {
                loc.parent = None;
                loc.deleted = true;
            }
        }
    }

    fn unlinked(&self, child: &Arc<Inode>, parent: &Arc<PathInode>, name: &str) {
        if let Some(node) = child.node().downcast_ref::<PathInode>() {
            let mut clients = self.path_lock.write();
            Self::unlinked_locked(&mut clients, node, parent, name);
        }
    }

    fn renamed(
        &self,
        old_parent: &Arc<PathInode>,
        old_name: &str,
        new_parent: &Arc<PathInode>,
        new_name: &str,
        moved: Option<Arc<Inode>>,
        replaced: Option<Arc<Inode>>,
    ) {
        let mut clients = self.path_lock.write();
        let moved_node = moved.as_ref().and_then(|m| m.node().downcast_ref::<PathInode>());

        if let Some(target) = replaced.as_ref().and_then(|r| r.node().downcast_ref::<PathInode>()) {
            let same = moved_node.is_some_and(|m| ptr::eq(m, target));
            if !same {
                Self::unlinked_locked(&mut clients, target, new_parent, new_name);
            }
        }

        let Some(node) = moved_node else {
            return;
        };
        if let Some(entries) = clients.get_mut(&node.client_inode()) {
            entries.retain(|e| !(Arc::ptr_eq(&e.parent, new_parent) && e.name == new_name));
            for entry in entries.iter_mut() {
                if Arc::ptr_eq(&entry.parent, old_parent) && entry.name == old_name {
                    entry.parent = new_parent.clone();
                    entry.name = new_name.to_string();
                }
            }
        }
        let mut loc = node.location.lock();
        if loc.is_at(old_parent, old_name) {
            loc.parent = Some(new_parent.clone());
            loc.name = new_name.to_string();
        }
    }

    fn forgotten(&self, node: &PathInode) {
        let ino = node.client_inode();
        if ino == 0 {
            return;
        }
        let mut clients = self.path_lock.write();
        if let Some(entries) = clients.get_mut(&ino) {
            entries.retain(|e| !ptr::eq(Arc::as_ptr(&e.node), node));
            if entries.is_empty() {
                clients.remove(&ino);
            }
        }
    }
}

impl NodeFileSystem for PathNodeFs {
    fn root(&self) -> Arc<dyn FsNode> {
        self.root.clone()
    }

    fn on_mount(&self, connector: &Arc<FileSystemConnector>) {
        if self.connector.set(Arc::downgrade(connector)).is_err() {
            tracing::warn!("{} mounted more than once", self.fs.name());
        }
        if let Some(me) = self.me.upgrade() {
            self.fs.on_mount(&me);
        }
    }

    fn on_unmount(&self) {
        self.fs.on_unmount();
    }

    fn name(&self) -> String {
        self.fs.name()
    }
}

struct Location {
    /// `None` for the root and for deleted nodes.
    parent: Option<Arc<PathInode>>,
    name: String,
    deleted: bool,
}

impl Location {
    fn is_at(&self, parent: &Arc<PathInode>, name: &str) -> bool {
        self.name == name && self.parent.as_ref().is_some_and(|p| Arc::ptr_eq(p, parent))
    }
}

/// A node of a [`PathNodeFs`].
pub struct PathInode {
    me: Weak<PathInode>,
    pathfs: Weak<PathNodeFs>,
    location: Mutex<Location>,
    /// Backend inode number in client inode mode, else zero.
    client_inode: AtomicU64,
    inode: OnceLock<Weak<Inode>>,
}

impl PathInode {
    fn new(pathfs: Weak<PathNodeFs>, parent: Option<Arc<PathInode>>, name: String) -> Arc<Self> {
        Arc::new_cyclic(|me| PathInode {
            me: me.clone(),
            pathfs,
            location: Mutex::new(Location {
                parent,
                name,
                deleted: false,
            }),
            client_inode: AtomicU64::new(0),
            inode: OnceLock::new(),
        })
    }

    /// The tree inode this node is attached to.
    pub fn inode(&self) -> Option<Arc<Inode>> {
        self.inode.get().and_then(Weak::upgrade)
    }

    pub fn client_inode(&self) -> u64 {
        self.client_inode.load(Ordering::Relaxed)
    }

    pub fn is_deleted(&self) -> bool {
        self.location.lock().deleted
    }

    /// Path relative to the filesystem root, or `None` once deleted.
    pub fn path(&self) -> Option<String> {
        let pathfs = self.pathfs.upgrade()?;
        let _guard = pathfs.path_lock.read();
        self.path_locked()
    }

    fn path_locked(&self) -> Option<String> {
        let mut names = Vec::new();
        let mut next = {
            let loc = self.location.lock();
            if loc.deleted {
                return None;
            }
            if loc.parent.is_some() {
                names.push(loc.name.clone());
            }
            loc.parent.clone()
        };
        while let Some(node) = next {
            let loc = node.location.lock();
            if loc.deleted {
                return None;
            }
            if loc.parent.is_some() {
                names.push(loc.name.clone());
            }
            next = loc.parent.clone();
        }
        names.reverse();
        Some(names.join("/"))
    }

    fn pathfs(&self) -> Result<Arc<PathNodeFs>, Status> {
        self.pathfs.upgrade().ok_or(Status::ENODEV)
    }

    fn this(&self) -> Result<Arc<PathInode>, Status> {
        self.me.upgrade().ok_or(Status::EIO)
    }

    fn own_path(&self) -> Result<String, Status> {
        self.path().ok_or(Status::ENOENT)
    }

    fn child_path(&self, name: &str) -> Result<String, Status> {
        self.own_path().map(|dir| join_path(&dir, name))
    }

    /// Run `f` with the backend and this node's path.
    fn with_path(&self, f: impl FnOnce(&dyn PathFileSystem, &str) -> Status) -> Status {
        match self.pathfs().and_then(|pathfs| self.own_path().map(|path| (pathfs, path))) {
            Ok((pathfs, path)) => f(pathfs.fs.as_ref(), &path),
            Err(status) => status,
        }
    }

    /// Link a node for `name` with attributes `attr` under `inode`, reusing
    /// the node of a known backend inode in client inode mode.
    fn create_child(
        &self,
        pathfs: &PathNodeFs,
        inode: &Arc<Inode>,
        name: &str,
        attr: &Attr,
    ) -> Result<Arc<Inode>, Status> {
        let this = self.this()?;
        let is_dir = attr.mode & S_IFMT == S_IFDIR;
        let ino = if pathfs.options.client_inodes && !is_dir {
            attr.ino
        } else {
            0
        };

        if ino != 0 {
            let existing = pathfs
                .find_client_inode(ino)
                .and_then(|node| node.inode().map(|inode| (node, inode)))
                .filter(|(_, inode)| !inode.is_dropped());
            if let Some((node, existing_inode)) = existing {
                inode.add_child(name, &existing_inode);
                pathfs.add_client_entry(ino, &this, name, &node);
                return Ok(existing_inode);
            }
        }

        let child = PathInode::new(pathfs.me.clone(), Some(this.clone()), name.to_string());
        child.client_inode.store(ino, Ordering::Relaxed);
        let child_inode = inode.new_child(name, is_dir, child.clone());
        if ino != 0 {
            pathfs.add_client_entry(ino, &this, name, &child);
        }
        Ok(child_inode)
    }

    /// Describe the freshly made `name` and link it in.
    fn new_entry(&self, inode: &Arc<Inode>, name: &str, path: &str, ctx: &Context) -> Result<NewEntry, Status> {
        let pathfs = self.pathfs()?;
        let attr = pathfs.fs.get_attr(path, ctx)?;
        let child = self.create_child(&pathfs, inode, name, &attr)?;
        Ok((child, attr))
    }

    fn remove(
        &self,
        inode: &Arc<Inode>,
        name: &str,
        op: impl FnOnce(&dyn PathFileSystem, &str) -> Status,
    ) -> Result<(), Status> {
        let pathfs = self.pathfs()?;
        let path = self.child_path(name)?;
        op(pathfs.fs.as_ref(), &path).into_result()?;
        if let Some(child) = inode.get_child(name) {
            pathfs.unlinked(&child, &self.this()?, name);
        }
        Ok(())
    }

    fn do_rename(
        &self,
        inode: &Arc<Inode>,
        old_name: &str,
        new_parent: &Arc<Inode>,
        new_name: &str,
        ctx: &Context,
    ) -> Result<(), Status> {
        let new_dir = new_parent
            .node()
            .downcast_ref::<PathInode>()
            .ok_or(Status::EXDEV)?
            .this()?;
        let pathfs = self.pathfs()?;
        let old_path = self.child_path(old_name)?;
        let new_path = new_dir.child_path(new_name)?;
        pathfs.fs.rename(&old_path, &new_path, ctx).into_result()?;

        let moved = inode.get_child(old_name);
        let replaced = new_parent.get_child(new_name);
        pathfs.renamed(&self.this()?, old_name, &new_dir, new_name, moved, replaced);
        Ok(())
    }
}

fn into_status(result: Result<(), Status>) -> Status {
    match result {
        Ok(()) => Status::OK,
        Err(status) => status,
    }
}

impl FsNode for PathInode {
    fn on_attach(&self, inode: &Arc<Inode>) {
        if self.inode.set(Arc::downgrade(inode)).is_err() {
            tracing::warn!("Path node attached to a second inode");
        }
    }

    fn on_forget(&self) {
        if let Ok(pathfs) = self.pathfs() {
            pathfs.forgotten(self);
        }
    }

    fn lookup(&self, inode: &Arc<Inode>, name: &str, ctx: &Context) -> Result<NewEntry, Status> {
        let path = self.child_path(name)?;
        self.new_entry(inode, name, &path, ctx)
    }

    fn get_attr(&self, ctx: &Context) -> Result<Attr, Status> {
        let path = self.own_path()?;
        self.pathfs()?.fs.get_attr(&path, ctx)
    }

    fn readlink(&self, ctx: &Context) -> Result<Vec<u8>, Status> {
        let path = self.own_path()?;
        self.pathfs()?.fs.readlink(&path, ctx)
    }

    fn mknod(&self, inode: &Arc<Inode>, name: &str, mode: u32, dev: u32, ctx: &Context) -> Result<NewEntry, Status> {
        let path = self.child_path(name)?;
        self.pathfs()?.fs.mknod(&path, mode, dev, ctx).into_result()?;
        self.new_entry(inode, name, &path, ctx)
    }

    fn mkdir(&self, inode: &Arc<Inode>, name: &str, mode: u32, ctx: &Context) -> Result<NewEntry, Status> {
        let path = self.child_path(name)?;
        self.pathfs()?.fs.mkdir(&path, mode, ctx).into_result()?;
        self.new_entry(inode, name, &path, ctx)
    }

    fn unlink(&self, inode: &Arc<Inode>, name: &str, ctx: &Context) -> Status {
        into_status(self.remove(inode, name, |fs, path| fs.unlink(path, ctx)))
    }

    fn rmdir(&self, inode: &Arc<Inode>, name: &str, ctx: &Context) -> Status {
        into_status(self.remove(inode, name, |fs, path| fs.rmdir(path, ctx)))
    }

    fn symlink(&self, inode: &Arc<Inode>, name: &str, target: &str, ctx: &Context) -> Result<NewEntry, Status> {
        let path = self.child_path(name)?;
        self.pathfs()?.fs.symlink(target, &path, ctx).into_result()?;
        self.new_entry(inode, name, &path, ctx)
    }

    fn rename(
        &self,
        inode: &Arc<Inode>,
        old_name: &str,
        new_parent: &Arc<Inode>,
        new_name: &str,
        ctx: &Context,
    ) -> Status {
        into_status(self.do_rename(inode, old_name, new_parent, new_name, ctx))
    }

    fn link(&self, inode: &Arc<Inode>, name: &str, existing: &Arc<Inode>, ctx: &Context) -> Result<NewEntry, Status> {
        let target = existing
            .node()
            .downcast_ref::<PathInode>()
            .ok_or(Status::EXDEV)?;
        let old_path = target.own_path()?;
        let new_path = self.child_path(name)?;
        self.pathfs()?.fs.link(&old_path, &new_path, ctx).into_result()?;
        self.new_entry(inode, name, &new_path, ctx)
    }

    fn create(
        &self,
        inode: &Arc<Inode>,
        name: &str,
        flags: u32,
        mode: u32,
        ctx: &Context,
    ) -> Result<(Box<dyn File>, Arc<Inode>, Attr), Status> {
        let pathfs = self.pathfs()?;
        let path = self.child_path(name)?;
        let file = pathfs.fs.create(&path, flags, mode, ctx)?;
        let attr = pathfs.fs.get_attr(&path, ctx)?;
        let child = self.create_child(&pathfs, inode, name, &attr)?;
        Ok((file, child, attr))
    }

    fn open(&self, flags: u32, ctx: &Context) -> Result<Box<dyn File>, Status> {
        let path = self.own_path()?;
        self.pathfs()?.fs.open(&path, flags, ctx)
    }

    fn open_dir(&self, ctx: &Context) -> Result<Vec<DirEntry>, Status> {
        let path = self.own_path()?;
        self.pathfs()?.fs.open_dir(&path, ctx)
    }

    fn get_xattr(&self, attr: &str, ctx: &Context) -> Result<Vec<u8>, Status> {
        let path = self.own_path()?;
        self.pathfs()?.fs.get_xattr(&path, attr, ctx)
    }

    fn list_xattr(&self, ctx: &Context) -> Result<Vec<String>, Status> {
        let path = self.own_path()?;
        self.pathfs()?.fs.list_xattr(&path, ctx)
    }

    fn set_xattr(&self, attr: &str, data: &[u8], flags: u32, ctx: &Context) -> Status {
        self.with_path(|fs, path| fs.set_xattr(path, attr, data, flags, ctx))
    }

    fn remove_xattr(&self, attr: &str, ctx: &Context) -> Status {
        self.with_path(|fs, path| fs.remove_xattr(path, attr, ctx))
    }

    fn access(&self, mask: u32, ctx: &Context) -> Status {
        self.with_path(|fs, path| fs.access(path, mask, ctx))
    }

    fn chmod(&self, perms: u32, ctx: &Context) -> Status {
        self.with_path(|fs, path| fs.chmod(path, perms, ctx))
    }

    fn chown(&self, uid: Option<u32>, gid: Option<u32>, ctx: &Context) -> Status {
        self.with_path(|fs, path| fs.chown(path, uid, gid, ctx))
    }

    fn truncate(&self, size: u64, ctx: &Context) -> Status {
        self.with_path(|fs, path| fs.truncate(path, size, ctx))
    }

    fn utimens(&self, atime: Option<SystemTime>, mtime: Option<SystemTime>, ctx: &Context) -> Status {
        self.with_path(|fs, path| fs.utimens(path, atime, mtime, ctx))
    }

    fn statfs(&self) -> Result<Kstatfs, Status> {
        let path = self.own_path()?;
        self.pathfs()?.fs.statfs(&path)
    }
}
