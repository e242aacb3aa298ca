use std::fs::File;
use std::io::{self, IoSlice, Read, Write};

/// The byte channel a session talks to the kernel over.
///
/// Each read yields exactly one request and each write carries exactly one
/// reply; implementations must not split or merge messages.
pub trait Transport: Send + Sync {
    /// Read one message into `buf`, returning its length.
    fn read_message(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one message made of the concatenation of `parts`.
    fn write_message(&self, parts: &[&[u8]]) -> io::Result<()>;
}

/// The `/dev/fuse` descriptor handed over by `fusermount`.
#[derive(Debug)]
pub struct DeviceTransport {
    file: File,
}

impl DeviceTransport {
    pub fn new(file: File) -> Self {
        DeviceTransport { file }
    }
}

impl Transport for DeviceTransport {
    fn read_message(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.file).read(buf)
    }

    fn write_message(&self, parts: &[&[u8]]) -> io::Result<()> {
        let total: usize = parts.iter().map(|p| p.len()).sum();
        let slices: Vec<IoSlice<'_>> = parts
            .iter()
            .filter(|p| !p.is_empty())
            .map(|p| IoSlice::new(p))
            .collect();
        // The device takes a message in a single write or not at all.
        let written = (&self.file).write_vectored(&slices)?;
        if written != total {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short write to device: {} of {} bytes", written, total),
            ));
        }
        Ok(())
    }
}
