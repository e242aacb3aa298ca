use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::FileSystemOptions;
use crate::handle::HandleMap;
use crate::nodefs::inode::{Inode, TreeState};
use crate::nodefs::mount::FileSystemMount;
use crate::nodefs::NodeFileSystem;
use crate::raw::{Attr, Status, FUSE_ROOT_ID};
use crate::request::Context;
use crate::session::Notifier;

/// Serves a tree of [`Inode`]s to the kernel.
///
/// Node ids handed to the kernel come from the inode handle map; the root
/// is always [`FUSE_ROOT_ID`]. An inode holds a node id exactly while the
/// kernel holds lookup references to it.
pub struct FileSystemConnector {
    inode_map: HandleMap<Inode>,
    root: Arc<Inode>,
    notifier: RwLock<Option<Notifier>>,
}

impl std::fmt::Debug for FileSystemConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSystemConnector")
            .field("known_inodes", &self.inode_map.count())
            .finish()
    }
}

impl FileSystemConnector {
    /// Mount `fs` at the root of a new tree.
    pub fn new(fs: Arc<dyn NodeFileSystem>, options: FileSystemOptions) -> Arc<Self> {
        Self::with_inode_map(fs, options, HandleMap::new())
    }

    /// Like [`new`](Self::new), but node ids are derived from inode
    /// addresses.
    ///
    /// # Safety
    ///
    /// Same contract as [`HandleMap::new_address_map`]: node ids coming
    /// back from the kernel are trusted to be live.
    pub unsafe fn new_with_address_handles(
        fs: Arc<dyn NodeFileSystem>,
        options: FileSystemOptions,
    ) -> Arc<Self> {
        Self::with_inode_map(fs, options, HandleMap::new_address_map())
    }

    fn with_inode_map(
        fs: Arc<dyn NodeFileSystem>,
        options: FileSystemOptions,
        inode_map: HandleMap<Inode>,
    ) -> Arc<Self> {
        let mount = FileSystemMount::new(fs.clone(), options, None);
        let root = Inode::new(true, fs.root(), mount.clone());
        mount.set_root(&root);
        root.set_mount_point(Some(mount));
        {
            let mut st = root.tree.lock();
            st.node_id = FUSE_ROOT_ID;
            st.lookup_count = 1;
        }

        let connector = Arc::new(FileSystemConnector {
            inode_map,
            root,
            notifier: RwLock::new(None),
        });
        fs.on_mount(&connector);
        connector
    }

    pub fn root(&self) -> &Arc<Inode> {
        &self.root
    }

    /// Number of inodes the kernel currently holds node ids for, root excluded.
    pub fn known_inode_count(&self) -> usize {
        self.inode_map.count()
    }

    pub(crate) fn set_notifier(&self, notifier: Option<Notifier>) {
        *self.notifier.write() = notifier;
    }

    pub(crate) fn to_inode(&self, node_id: u64) -> Arc<Inode> {
        if node_id == FUSE_ROOT_ID {
            return self.root.clone();
        }
        self.inode_map
            .decode(node_id)
            .unwrap_or_else(|err| panic!("node id from kernel: {}", err))
    }

    /// Take one kernel reference. Caller holds the node's mount tree lock.
    fn lookup_update_locked(&self, node: &Arc<Inode>, st: &mut TreeState) -> u64 {
        if st.lookup_count == 0 {
            st.node_id = self.inode_map.register(node);
        }
        st.lookup_count += 1;
        st.node_id
    }

    /// Take one kernel reference and return the node id.
    pub(crate) fn lookup_update(&self, node: &Arc<Inode>) -> u64 {
        let _guard = node.mount().tree_lock.write();
        let mut st = node.tree.lock();
        self.lookup_update_locked(node, &mut st)
    }

    /// Drop `n` kernel references. At zero the node id is released and the
    /// node, with whatever beneath it is unused, leaves the tree.
    pub(crate) fn forget_update(&self, node: &Arc<Inode>, n: u64) {
        let mount = node.mount().clone();
        let _guard = mount.tree_lock.write();
        let released = {
            let mut st = node.tree.lock();
            if n > st.lookup_count {
                panic!(
                    "lookup count underflow on node {:#x}: forgetting {} of {}",
                    st.node_id, n, st.lookup_count
                );
            }
            st.lookup_count -= n;
            if st.lookup_count == 0 && st.node_id != 0 {
                Some(std::mem::replace(&mut st.node_id, 0))
            } else {
                None
            }
        };

        if let Some(node_id) = released {
            if let Err(err) = self.inode_map.forget(node_id) {
                panic!("forgetting node {:#x}: {}", node_id, err);
            }
            if self.sweep(node) {
                self.detach(node);
            }
        }
    }

    /// Detach unused descendants of `node` and report whether `node` itself
    /// can go. Caller holds the mount tree lock.
    fn sweep(&self, node: &Arc<Inode>) -> bool {
        let children: Vec<Arc<Inode>> = node
            .tree
            .lock()
            .children
            .iter()
            .flatten()
            .map(|(_, child)| child.clone())
            .collect();

        for child in children {
            // Other mounts are swept under their own lock.
            if !Arc::ptr_eq(child.mount(), node.mount()) {
                continue;
            }
            if self.sweep(&child) {
                self.detach(&child);
            }
        }
        self.droppable(node)
    }

    fn droppable(&self, node: &Arc<Inode>) -> bool {
        if node.is_mount_root() {
            return false;
        }
        let unused = {
            let st = node.tree.lock();
            st.lookup_count == 0 && st.children.as_ref().map_or(true, |c| c.is_empty())
        };
        unused && node.open_files.lock().is_empty() && node.node().deletable()
    }

    /// Remove `node` from every parent and tell its node it is gone.
    fn detach(&self, node: &Arc<Inode>) {
        let parents = {
            let mut st = node.tree.lock();
            if st.dropped {
                return;
            }
            st.dropped = true;
            std::mem::take(&mut st.parents)
        };

        for (parent, name) in parents {
            let Some(parent) = parent.upgrade() else {
                continue;
            };
            let mut pst = parent.tree.lock();
            let listed = pst
                .children
                .as_ref()
                .and_then(|c| c.get(&name))
                .is_some_and(|c| Arc::ptr_eq(c, node));
            if listed {
                if let Some(children) = pst.children.as_mut() {
                    children.remove(&name);
                }
            } else {
                tracing::error!("Dropping {:?}: not found among its parent's children", name);
            }
        }
        node.node().on_forget();
    }

    /// Retry dropping a node whose last open handle went away.
    pub(crate) fn consider_drop(&self, node: &Arc<Inode>) {
        let _guard = node.mount().tree_lock.write();
        if self.sweep(node) {
            self.detach(node);
        }
    }

    /// Resolve `name` under `parent` and take a kernel reference on the
    /// result.
    pub(crate) fn internal_lookup(
        &self,
        parent: &Arc<Inode>,
        name: &str,
        ctx: &Context,
    ) -> Result<(Arc<Inode>, u64, Attr), Status> {
        let known = {
            let _guard = parent.mount().tree_lock.write();
            let child = parent
                .tree
                .lock()
                .children
                .as_ref()
                .and_then(|c| c.get(name))
                .cloned();
            child.map(|child| {
                if Arc::ptr_eq(child.mount(), parent.mount()) {
                    let mut st = child.tree.lock();
                    let node_id = self.lookup_update_locked(&child, &mut st);
                    drop(st);
                    (child, Some(node_id))
                } else {
                    // A mount root; counted under its own mount's lock.
                    (child, None)
                }
            })
        };

        let (child, node_id) = match known {
            Some((child, Some(node_id))) => (child, node_id),
            Some((child, None)) => {
                let node_id = self.lookup_update(&child);
                (child, node_id)
            }
            None => {
                let (child, attr) = parent.node().lookup(parent, name, ctx)?;
                let node_id = self.lookup_update(&child);
                return Ok((child, node_id, attr));
            }
        };

        match child.node().get_attr(ctx) {
            Ok(attr) => Ok((child, node_id, attr)),
            Err(status) => {
                self.forget_update(&child, 1);
                Err(status)
            }
        }
    }

    /// Graft `fs` into the tree as `name` under `parent`. Fails with
    /// `EEXIST` if the tree already has a child of that name.
    pub fn mount(
        self: &Arc<Self>,
        parent: &Arc<Inode>,
        name: &str,
        fs: Arc<dyn NodeFileSystem>,
        options: Option<FileSystemOptions>,
    ) -> Status {
        {
            let _guard = parent.mount().tree_lock.write();
            let mut st = parent.tree.lock();
            let Some(children) = st.children.as_ref() else {
                return Status::ENOTDIR;
            };
            if children.contains_key(name) || st.mounts.contains_key(name) {
                return Status::EEXIST;
            }

            let options = options.unwrap_or_else(|| parent.mount().options.clone());
            let mount = FileSystemMount::new(fs.clone(), options, Some(parent));
            let root = Inode::new(true, fs.root(), mount.clone());
            mount.set_root(&root);
            root.set_mount_point(Some(mount.clone()));
            st.mounts.insert(name.to_string(), mount);
            drop(st);
            parent.add_child_locked(name, &root);
        }

        tracing::debug!("Mounted {} as {:?}", fs.name(), name);
        fs.on_mount(self);
        Status::OK
    }

    /// Undo [`mount`](Self::mount) for the mount rooted at `node`.
    ///
    /// Fails with `EINVAL` if `node` is not the root of a nested mount, and
    /// with `EBUSY` while files are open in the mount or mounts sit below it.
    pub fn unmount(&self, node: &Arc<Inode>) -> Status {
        let Some(mount) = node.mount_point() else {
            return Status::EINVAL;
        };
        let Some(parent) = mount.parent() else {
            return Status::EINVAL;
        };

        let name = {
            let _parent_guard = parent.mount().tree_lock.write();
            let _guard = mount.tree_lock.write();
            let _files = mount.files_lock.write();
            if mount.open_file_count() > 0 {
                return Status::EBUSY;
            }
            if has_submounts(node) {
                return Status::EBUSY;
            }

            let mut pst = parent.tree.lock();
            let Some(name) = pst
                .mounts
                .iter()
                .find(|(_, m)| Arc::ptr_eq(m, &mount))
                .map(|(name, _)| name.clone())
            else {
                return Status::EINVAL;
            };
            pst.mounts.remove(&name);
            drop(pst);
            parent.rm_child_locked(&name);
            node.set_mount_point(None);
            name
        };

        mount.fs().on_unmount();
        tracing::debug!("Unmounted {:?}", name);

        let code = self.entry_notify(&parent, &name);
        if !code.ok() && code != Status::ENOSYS {
            tracing::warn!("Entry notify after unmount of {:?}: {}", name, code);
        }
        Status::OK
    }

    /// Walk `path` from `start` as far as the tree knows it. Returns the
    /// last inode reached and the components left over.
    pub fn node(&self, start: &Arc<Inode>, path: &str) -> (Arc<Inode>, Vec<String>) {
        let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        let mut current = start.clone();
        for (i, component) in components.iter().enumerate() {
            match current.get_child(component) {
                Some(next) => current = next,
                None => {
                    let rest = components[i..].iter().map(|c| c.to_string()).collect();
                    return (current, rest);
                }
            }
        }
        (current, Vec::new())
    }

    /// The inode at `path` below the root, if the tree knows it.
    pub fn lookup_node(&self, path: &str) -> Option<Arc<Inode>> {
        let (node, rest) = self.node(&self.root, path);
        rest.is_empty().then_some(node)
    }

    /// [`mount`](Self::mount) at a slash-separated path below the root.
    pub fn mount_at(
        self: &Arc<Self>,
        path: &str,
        fs: Arc<dyn NodeFileSystem>,
        options: Option<FileSystemOptions>,
    ) -> Status {
        let path = path.trim_matches('/');
        let (dir, name) = match path.rsplit_once('/') {
            Some((dir, name)) => (dir, name),
            None => ("", path),
        };
        if name.is_empty() {
            return Status::EINVAL;
        }
        match self.lookup_node(dir) {
            Some(parent) => self.mount(&parent, name, fs, options),
            None => Status::ENOENT,
        }
    }

    /// [`unmount`](Self::unmount) the mount rooted at `path`.
    pub fn unmount_at(&self, path: &str) -> Status {
        match self.lookup_node(path) {
            Some(node) => self.unmount(&node),
            None => Status::ENOENT,
        }
    }

    /// Ask the kernel to drop cached data of `node` in `[off, off+length)`.
    /// `ENOSYS` while no session is serving the tree.
    pub fn inode_notify(&self, node: &Inode, off: i64, length: i64) -> Status {
        let node_id = node.node_id();
        if node_id == 0 {
            return Status::OK;
        }
        match self.notifier.read().as_ref() {
            Some(notifier) => notifier.inode_notify(node_id, off, length),
            None => Status::ENOSYS,
        }
    }

    /// Ask the kernel to drop its cached entry `name` under `parent`.
    pub fn entry_notify(&self, parent: &Inode, name: &str) -> Status {
        let node_id = parent.node_id();
        if node_id == 0 {
            return Status::OK;
        }
        match self.notifier.read().as_ref() {
            Some(notifier) => notifier.entry_notify(node_id, name),
            None => Status::ENOSYS,
        }
    }
}

/// Whether any mount sits below `node` within its own mount.
fn has_submounts(node: &Arc<Inode>) -> bool {
    let children: Vec<Arc<Inode>> = node
        .tree
        .lock()
        .children
        .iter()
        .flatten()
        .map(|(_, child)| child.clone())
        .collect();
    children
        .iter()
        .any(|child| !Arc::ptr_eq(child.mount(), node.mount()) || has_submounts(child))
}
