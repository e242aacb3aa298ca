use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::raw::{
    NotifyInvalEntryOut, NotifyInvalInodeOut, Status, FUSE_NOTIFY_INVAL_ENTRY,
    FUSE_NOTIFY_INVAL_INODE,
};
use crate::request::notify_message;
use crate::session::Transport;

/// Kernel minor version that introduced cache invalidation notices.
const NOTIFY_MINOR: u32 = 12;

/// Sends unsolicited cache invalidation messages to the kernel.
#[derive(Clone)]
pub struct Notifier {
    transport: Arc<dyn Transport>,
    kernel_minor: Arc<AtomicU32>,
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifier")
            .field("kernel_minor", &self.kernel_minor.load(Ordering::Relaxed))
            .finish()
    }
}

impl Notifier {
    pub(crate) fn new(transport: Arc<dyn Transport>, kernel_minor: Arc<AtomicU32>) -> Self {
        Notifier {
            transport,
            kernel_minor,
        }
    }

    fn supported(&self) -> bool {
        self.kernel_minor.load(Ordering::Acquire) >= NOTIFY_MINOR
    }

    /// Invalidate cached data of node `node_id` in `[off, off+length)`.
    /// A zero length means to the end of the file.
    pub fn inode_notify(&self, node_id: u64, off: i64, length: i64) -> Status {
        if !self.supported() {
            return Status::ENOSYS;
        }
        let body = NotifyInvalInodeOut {
            ino: node_id,
            off,
            length,
        };
        let msg = notify_message(FUSE_NOTIFY_INVAL_INODE, &body, &[]);
        tracing::debug!("Notify inode {:#x} off {} len {}", node_id, off, length);
        self.send(&msg)
    }

    /// Invalidate the cached entry `name` under node `parent`.
    pub fn entry_notify(&self, parent: u64, name: &str) -> Status {
        if !self.supported() {
            return Status::ENOSYS;
        }
        let body = NotifyInvalEntryOut {
            parent,
            namelen: name.len() as u32,
            padding: 0,
        };
        let mut trailer = Vec::with_capacity(name.len() + 1);
        trailer.extend_from_slice(name.as_bytes());
        trailer.push(0);
        let msg = notify_message(FUSE_NOTIFY_INVAL_ENTRY, &body, &trailer);
        tracing::debug!("Notify entry {:?} under {:#x}", name, parent);
        self.send(&msg)
    }

    fn send(&self, msg: &[u8]) -> Status {
        match self.transport.write_message(&[msg]) {
            Ok(()) => Status::OK,
            Err(err) => Status::from(err),
        }
    }
}
