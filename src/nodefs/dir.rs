use parking_lot::Mutex;

use crate::raw::DirEntryList;

/// Ino reported in dirents; the kernel looks names up for real numbers.
const UNKNOWN_INO: u64 = 0xffff_ffff;

/// One name in a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    /// Only the file type bits are used.
    pub mode: u32,
}

impl DirEntry {
    pub fn new(name: impl Into<String>, mode: u32) -> Self {
        DirEntry {
            name: name.into(),
            mode,
        }
    }
}

struct Listing {
    entries: Vec<DirEntry>,
    /// Set once any part of the listing went out.
    served: bool,
}

/// Snapshot of a directory, served in chunks. A read from offset zero after
/// the first one starts over on a fresh snapshot.
pub(crate) struct DirStream {
    listing: Mutex<Listing>,
}

impl DirStream {
    pub(crate) fn new(entries: Vec<DirEntry>) -> Self {
        DirStream {
            listing: Mutex::new(Listing {
                entries,
                served: false,
            }),
        }
    }

    /// Whether a read at `offset` rewinds a listing already handed out.
    pub(crate) fn is_rewind(&self, offset: u64) -> bool {
        offset == 0 && self.listing.lock().served
    }

    pub(crate) fn reset(&self, entries: Vec<DirEntry>) {
        *self.listing.lock() = Listing {
            entries,
            served: false,
        };
    }

    /// Emit entries starting at stream position `offset` until `out` is full.
    pub(crate) fn fill(&self, offset: u64, out: &mut DirEntryList) {
        let mut listing = self.listing.lock();
        listing.served = true;
        let start = usize::try_from(offset).unwrap_or(usize::MAX);
        for entry in listing.entries.iter().skip(start) {
            if !out.add(entry.name.as_bytes(), UNKNOWN_INO, entry.mode) {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raw::{S_IFDIR, S_IFREG};

    fn stream(n: usize) -> DirStream {
        DirStream::new(
            (0..n)
                .map(|i| DirEntry::new(format!("entry{}", i), if i % 2 == 0 { S_IFREG } else { S_IFDIR }))
                .collect(),
        )
    }

    #[test]
    fn test_fill_resumes_at_offset() {
        let dir = stream(10);

        let mut first = DirEntryList::new(32 * 3, 0);
        dir.fill(0, &mut first);
        assert_eq!(first.offset(), 3);

        let mut rest = DirEntryList::new(4096, first.offset());
        dir.fill(first.offset(), &mut rest);
        assert_eq!(rest.offset(), 10);
    }

    #[test]
    fn test_fill_past_end_is_empty() {
        let dir = stream(2);
        let mut out = DirEntryList::new(4096, 5);
        dir.fill(5, &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn test_rewind_only_after_first_read() {
        let dir = stream(3);
        assert!(!dir.is_rewind(0));

        let mut out = DirEntryList::new(4096, 0);
        dir.fill(0, &mut out);
        assert!(dir.is_rewind(0));
        assert!(!dir.is_rewind(2));

        dir.reset(vec![DirEntry::new("fresh", S_IFREG)]);
        assert!(!dir.is_rewind(0));
        let mut out = DirEntryList::new(4096, 0);
        dir.fill(0, &mut out);
        assert_eq!(out.offset(), 1);
    }
}
