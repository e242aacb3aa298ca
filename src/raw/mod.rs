//! Wire codec for the kernel FUSE protocol.

mod attr;
mod dirent;
pub mod opcode;
mod status;
pub mod types;

pub use attr::{attr_from_metadata, file_type_bits};
pub use dirent::DirEntryList;
pub use opcode::{operation_name, OpInfo, Opcode};
pub use status::Status;
pub use types::*;

