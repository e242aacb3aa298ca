//! A userspace filesystem engine speaking the kernel FUSE protocol.
//!
//! Layers, bottom up: the wire codec ([`raw`], [`request`]), the mount
//! session ([`session`]) dispatching into a [`RawFileSystem`], the inode
//! tree ([`nodefs`]) implementing it on top of per-node filesystems, and
//! the path adapter ([`pathfs`]) for filesystems addressed by path.

pub mod bufferpool;
pub mod config;
pub mod error;
pub mod handle;
pub mod nodefs;
pub mod pathfs;
pub mod raw;
pub mod rawfs;
pub mod request;
pub mod session;

pub use config::load_config;
pub use config::Config;
pub use config::FileSystemOptions;
pub use config::MountOptions;
pub use config::PathNodeFsOptions;

pub use error::{FuseError, Result};

pub use nodefs::FileSystemConnector;
pub use pathfs::{LoopbackFileSystem, PathFileSystem, PathNodeFs};
pub use rawfs::RawFileSystem;
pub use session::MountState;
