use std::fs;
use std::os::unix::fs::{FileExt, PermissionsExt};
use std::time::SystemTime;

use parking_lot::Mutex;

use crate::nodefs::File;
use crate::raw::{attr_from_metadata, Attr, Status, FUSE_FSYNC_FDATASYNC, S_IFREG};

/// Read-only file serving a fixed byte string.
#[derive(Debug, Clone)]
pub struct DataFile {
    data: Vec<u8>,
}

impl DataFile {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        DataFile { data: data.into() }
    }
}

impl File for DataFile {
    fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize, Status> {
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(self.data.len());
        let n = buf.len().min(self.data.len() - start);
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        Ok(n)
    }

    fn get_attr(&self) -> Result<Attr, Status> {
        Ok(Attr {
            mode: S_IFREG | 0o444,
            size: self.data.len() as u64,
            nlink: 1,
            ..Default::default()
        })
    }
}

/// File backed by an open descriptor on the host filesystem.
#[derive(Debug)]
pub struct LoopbackFile {
    file: Mutex<Option<fs::File>>,
}

impl LoopbackFile {
    pub fn new(file: fs::File) -> Self {
        LoopbackFile {
            file: Mutex::new(Some(file)),
        }
    }

    fn with_file<T>(&self, f: impl FnOnce(&fs::File) -> std::io::Result<T>) -> Result<T, Status> {
        let guard = self.file.lock();
        let file = guard.as_ref().ok_or(Status::EBADF)?;
        f(file).map_err(Status::from)
    }

    fn status(&self, f: impl FnOnce(&fs::File) -> std::io::Result<()>) -> Status {
        match self.with_file(f) {
            Ok(()) => Status::OK,
            Err(status) => status,
        }
    }
}

impl File for LoopbackFile {
    fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize, Status> {
        self.with_file(|file| {
            let mut total = 0;
            while total < buf.len() {
                let n = file.read_at(&mut buf[total..], offset + total as u64)?;
                if n == 0 {
                    break;
                }
                total += n;
            }
            Ok(total)
        })
    }

    fn write(&self, data: &[u8], offset: u64) -> Result<u32, Status> {
        self.with_file(|file| {
            file.write_all_at(data, offset)?;
            Ok(data.len() as u32)
        })
    }

    fn release(&self) {
        self.file.lock().take();
    }

    fn fsync(&self, flags: u32) -> Status {
        self.status(|file| {
            if flags & FUSE_FSYNC_FDATASYNC != 0 {
                file.sync_data()
            } else {
                file.sync_all()
            }
        })
    }

    fn get_attr(&self) -> Result<Attr, Status> {
        self.with_file(|file| file.metadata().map(|meta| attr_from_metadata(&meta)))
    }

    fn chmod(&self, perms: u32) -> Status {
        self.status(|file| file.set_permissions(fs::Permissions::from_mode(perms)))
    }

    fn chown(&self, uid: Option<u32>, gid: Option<u32>) -> Status {
        self.status(|file| std::os::unix::fs::fchown(file, uid, gid))
    }

    fn truncate(&self, size: u64) -> Status {
        self.status(|file| file.set_len(size))
    }

    fn utimens(&self, atime: Option<SystemTime>, mtime: Option<SystemTime>) -> Status {
        self.status(|file| file.set_times(file_times(atime, mtime)))
    }
}

pub(crate) fn file_times(atime: Option<SystemTime>, mtime: Option<SystemTime>) -> fs::FileTimes {
    let mut times = fs::FileTimes::new();
    if let Some(atime) = atime {
        times = times.set_accessed(atime);
    }
    if let Some(mtime) = mtime {
        times = times.set_modified(mtime);
    }
    times
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_data_file_reads_at_offset() {
        let file = DataFile::new(b"hello world".to_vec());
        let mut buf = [0u8; 5];
        assert_eq!(file.read(&mut buf, 6), Ok(5));
        assert_eq!(&buf, b"world");
        assert_eq!(file.read(&mut buf, 100), Ok(0));
        assert_eq!(file.get_attr().unwrap().size, 11);
        assert_eq!(file.write(b"x", 0), Err(Status::ENOSYS));
    }

    #[test]
    fn test_loopback_file_read_write() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"0123456789").unwrap();
        let handle = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(tmp.path())
            .unwrap();
        let file = LoopbackFile::new(handle);

        assert_eq!(file.write(b"abc", 2), Ok(3));
        let mut buf = [0u8; 10];
        assert_eq!(file.read(&mut buf, 0), Ok(10));
        assert_eq!(&buf, b"01abc56789");

        assert!(file.truncate(4).ok());
        assert_eq!(file.get_attr().unwrap().size, 4);

        file.release();
        assert_eq!(file.read(&mut buf, 0), Err(Status::EBADF));
    }
}
