use std::fs::Metadata;
use std::os::unix::fs::MetadataExt;

use crate::raw::types::{Attr, S_IFMT};

/// Convert filesystem metadata into kernel attributes.
///
/// Timestamps are taken from the raw stat fields so that nanoseconds and
/// pre-epoch values survive the conversion.
pub fn attr_from_metadata(meta: &Metadata) -> Attr {
    Attr {
        ino: meta.ino(),
        size: meta.size(),
        blocks: meta.blocks(),
        atime: meta.atime() as u64,
        mtime: meta.mtime() as u64,
        ctime: meta.ctime() as u64,
        atimensec: meta.atime_nsec() as u32,
        mtimensec: meta.mtime_nsec() as u32,
        ctimensec: meta.ctime_nsec() as u32,
        mode: meta.mode(),
        nlink: meta.nlink() as u32,
        uid: meta.uid(),
        gid: meta.gid(),
        rdev: meta.rdev() as u32,
        blksize: meta.blksize() as u32,
        padding: 0,
    }
}

/// The `d_type` value the kernel expects in a dirent for the given mode.
pub fn file_type_bits(mode: u32) -> u32 {
    (mode & S_IFMT) >> 12
}
