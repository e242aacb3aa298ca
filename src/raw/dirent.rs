use zerocopy::AsBytes;

use crate::raw::attr::file_type_bits;
use crate::raw::types::Dirent;

const DIRENT_ALIGN: usize = 8;

/// Accumulates directory entries in the kernel's dirent layout, up to the
/// size the kernel asked for.
pub struct DirEntryList {
    buf: Vec<u8>,
    max_size: usize,
    offset: u64,
}

impl DirEntryList {
    /// `offset` is the stream position of the first entry to be added.
    pub fn new(max_size: usize, offset: u64) -> Self {
        DirEntryList {
            buf: Vec::with_capacity(max_size.min(64 * 1024)),
            max_size,
            offset,
        }
    }

    /// Append one entry. Returns false if it does not fit; nothing is
    /// written in that case.
    pub fn add(&mut self, name: &[u8], ino: u64, mode: u32) -> bool {
        let padded = padded_len(name.len());
        let entry_size = std::mem::size_of::<Dirent>() + padded;
        if self.buf.len() + entry_size > self.max_size {
            return false;
        }

        self.offset += 1;
        let dirent = Dirent {
            ino,
            off: self.offset,
            namelen: name.len() as u32,
            typ: file_type_bits(mode),
        };
        self.buf.extend_from_slice(dirent.as_bytes());
        self.buf.extend_from_slice(name);
        self.buf.resize(self.buf.len() + padded - name.len(), 0);
        true
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

fn padded_len(len: usize) -> usize {
    (len + DIRENT_ALIGN - 1) & !(DIRENT_ALIGN - 1)
}
