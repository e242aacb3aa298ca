use std::fmt;
use std::sync::{Arc, Weak};

use fxhash::FxHashMap;
use parking_lot::Mutex;

use crate::handle::{HandleSlot, Handled};
use crate::nodefs::mount::{FileSystemMount, OpenedFile};
use crate::nodefs::FsNode;

/// Tree bookkeeping for one inode.
///
/// Only touched while holding the owning mount's tree lock; the mutex is
/// there for interior mutability.
pub(crate) struct TreeState {
    /// Kernel references to this inode.
    pub(crate) lookup_count: u64,
    /// Zero exactly when `lookup_count` is zero.
    pub(crate) node_id: u64,
    /// `None` for non-directories.
    pub(crate) children: Option<FxHashMap<String, Arc<Inode>>>,
    /// Mounts rooted at children of this inode, by name.
    pub(crate) mounts: FxHashMap<String, Arc<FileSystemMount>>,
    /// Every (parent, name) this inode is listed under.
    pub(crate) parents: Vec<(Weak<Inode>, String)>,
    /// Set once the inode has been detached and its node told to forget.
    pub(crate) dropped: bool,
}

/// A node of the in-memory tree.
pub struct Inode {
    slot: HandleSlot,
    node: Arc<dyn FsNode>,
    is_dir: bool,
    mount: Arc<FileSystemMount>,
    pub(crate) tree: Mutex<TreeState>,
    pub(crate) open_files: Mutex<Vec<Arc<OpenedFile>>>,
    /// Set on the root inode of a mount.
    mount_point: Mutex<Option<Arc<FileSystemMount>>>,
}

impl Handled for Inode {
    fn handle_slot(&self) -> &HandleSlot {
        &self.slot
    }
}

impl fmt::Debug for Inode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.tree.lock();
        f.debug_struct("Inode")
            .field("node_id", &st.node_id)
            .field("lookup_count", &st.lookup_count)
            .field("is_dir", &self.is_dir)
            .field("children", &st.children.as_ref().map(|c| c.len()))
            .finish()
    }
}

impl Inode {
    pub(crate) fn new(is_dir: bool, node: Arc<dyn FsNode>, mount: Arc<FileSystemMount>) -> Arc<Inode> {
        let inode = Arc::new(Inode {
            slot: HandleSlot::new(),
            node,
            is_dir,
            mount,
            tree: Mutex::new(TreeState {
                lookup_count: 0,
                node_id: 0,
                children: is_dir.then(FxHashMap::default),
                mounts: FxHashMap::default(),
                parents: Vec::new(),
                dropped: false,
            }),
            open_files: Mutex::new(Vec::new()),
            mount_point: Mutex::new(None),
        });
        inode.node.on_attach(&inode);
        inode
    }

    pub fn node(&self) -> &Arc<dyn FsNode> {
        &self.node
    }

    pub fn is_dir(&self) -> bool {
        self.is_dir
    }

    /// The mount this inode belongs to.
    pub fn mount(&self) -> &Arc<FileSystemMount> {
        &self.mount
    }

    /// Node id the kernel knows this inode by, or zero.
    pub fn node_id(&self) -> u64 {
        let _guard = self.mount.tree_lock.read();
        self.tree.lock().node_id
    }

    pub fn lookup_count(&self) -> u64 {
        let _guard = self.mount.tree_lock.read();
        self.tree.lock().lookup_count
    }

    /// Whether the inode has been removed from the tree for good.
    pub fn is_dropped(&self) -> bool {
        self.tree.lock().dropped
    }

    pub fn is_mount_root(&self) -> bool {
        self.mount_point.lock().is_some()
    }

    pub(crate) fn mount_point(&self) -> Option<Arc<FileSystemMount>> {
        self.mount_point.lock().clone()
    }

    pub(crate) fn set_mount_point(&self, mount: Option<Arc<FileSystemMount>>) {
        *self.mount_point.lock() = mount;
    }

    /// A fresh inode in the same mount, not yet linked anywhere.
    pub fn new_inode(&self, is_dir: bool, node: Arc<dyn FsNode>) -> Arc<Inode> {
        Inode::new(is_dir, node, self.mount.clone())
    }

    /// Create an inode for `node` and link it as `name`.
    pub fn new_child(self: &Arc<Self>, name: &str, is_dir: bool, node: Arc<dyn FsNode>) -> Arc<Inode> {
        let child = self.new_inode(is_dir, node);
        self.add_child(name, &child);
        child
    }

    /// Link `child` as `name`, replacing whatever was there.
    pub fn add_child(self: &Arc<Self>, name: &str, child: &Arc<Inode>) {
        let _guard = self.mount.tree_lock.write();
        self.add_child_locked(name, child);
    }

    pub(crate) fn add_child_locked(self: &Arc<Self>, name: &str, child: &Arc<Inode>) {
        let replaced = {
            let mut st = self.tree.lock();
            let Some(children) = st.children.as_mut() else {
                tracing::error!("add_child {:?} on a non-directory", name);
                return;
            };
            children.insert(name.to_string(), child.clone())
        };
        if let Some(old) = replaced {
            if !Arc::ptr_eq(&old, child) {
                old.remove_parent(self, name);
            } else {
                return;
            }
        }
        let mut cst = child.tree.lock();
        cst.parents.push((Arc::downgrade(self), name.to_string()));
        cst.dropped = false;
    }

    /// Unlink `name`, returning the inode that was there.
    pub fn rm_child(self: &Arc<Self>, name: &str) -> Option<Arc<Inode>> {
        let _guard = self.mount.tree_lock.write();
        self.rm_child_locked(name)
    }

    pub(crate) fn rm_child_locked(self: &Arc<Self>, name: &str) -> Option<Arc<Inode>> {
        let removed = self.tree.lock().children.as_mut()?.remove(name)?;
        removed.remove_parent(self, name);
        Some(removed)
    }

    fn remove_parent(&self, parent: &Arc<Inode>, name: &str) {
        let mut st = self.tree.lock();
        if let Some(pos) = st
            .parents
            .iter()
            .position(|(p, n)| n == name && std::ptr::eq(p.as_ptr(), Arc::as_ptr(parent)))
        {
            st.parents.swap_remove(pos);
        }
    }

    pub fn get_child(&self, name: &str) -> Option<Arc<Inode>> {
        let _guard = self.mount.tree_lock.read();
        self.tree.lock().children.as_ref()?.get(name).cloned()
    }

    pub fn children(&self) -> Vec<(String, Arc<Inode>)> {
        let _guard = self.mount.tree_lock.read();
        self.tree
            .lock()
            .children
            .iter()
            .flatten()
            .map(|(name, child)| (name.clone(), child.clone()))
            .collect()
    }

    /// One of the (parent, name) pairs this inode is listed under.
    pub fn parent(&self) -> Option<(Arc<Inode>, String)> {
        let _guard = self.mount.tree_lock.read();
        self.tree
            .lock()
            .parents
            .iter()
            .find_map(|(p, name)| p.upgrade().map(|p| (p, name.clone())))
    }

    /// Mount rooted at child `name`, if any.
    pub(crate) fn find_mount(&self, name: &str) -> Option<Arc<FileSystemMount>> {
        let _guard = self.mount.tree_lock.read();
        self.tree.lock().mounts.get(name).cloned()
    }

    /// Names of the mounts rooted at children of this inode.
    pub(crate) fn mount_names(&self) -> Vec<String> {
        let _guard = self.mount.tree_lock.read();
        self.tree.lock().mounts.keys().cloned().collect()
    }

    pub fn open_file_count(&self) -> usize {
        self.open_files.lock().len()
    }

    /// Open files whose open flags intersect `mask`; all of them for zero.
    pub fn files(&self, mask: u32) -> Vec<Arc<OpenedFile>> {
        self.open_files
            .lock()
            .iter()
            .filter(|f| mask == 0 || f.open_flags & mask != 0)
            .cloned()
            .collect()
    }
}
