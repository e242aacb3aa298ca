//! Parsing of raw device reads into typed requests, and serialization of
//! replies and notifications.

use std::mem::size_of;
use std::time::Instant;

use zerocopy::{AsBytes, FromBytes};

use crate::error::{FuseError, Result};
use crate::raw::{InHeader, OpInfo, Opcode, OutHeader, Status};

/// Caller identity taken from the request header.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Context {
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
}

impl From<&InHeader> for Context {
    fn from(header: &InHeader) -> Self {
        Context {
            uid: header.uid,
            gid: header.gid,
            pid: header.pid,
        }
    }
}

/// One request read from the device, borrowing the read buffer.
pub struct Request<'a> {
    pub header: InHeader,
    pub opcode: Option<Opcode>,
    pub status: Status,
    pub start: Instant,
    arg: &'a [u8],
    filenames: Vec<&'a str>,
    flat_data: &'a [u8],
    out_data: Vec<u8>,
    flat_out: Vec<u8>,
    flat_out_pooled: bool,
}

impl<'a> Request<'a> {
    /// Parse one message.
    ///
    /// Fails only when the header itself is unreadable, since then there is
    /// no unique id to reply to. Other malformations are recorded in
    /// `status` so the caller answers with an error.
    pub fn parse(input: &'a [u8]) -> Result<Request<'a>> {
        let header = InHeader::read_from_prefix(input).ok_or_else(|| {
            FuseError::Protocol(format!("short read of {} bytes for header", input.len()))
        })?;

        let mut req = Request {
            header,
            opcode: Opcode::from_u32(header.opcode),
            status: Status::OK,
            start: Instant::now(),
            arg: &input[size_of::<InHeader>()..],
            filenames: Vec::new(),
            flat_data: &[],
            out_data: Vec::new(),
            flat_out: Vec::new(),
            flat_out_pooled: false,
        };

        let Some(info) = req.info() else {
            tracing::warn!("Unknown opcode {}", header.opcode);
            req.status = Status::ENOSYS;
            return Ok(req);
        };

        if header.length as usize != input.len() {
            tracing::warn!(
                "{}: header length {} does not match read of {} bytes",
                info.name,
                header.length,
                input.len()
            );
            req.status = Status::EIO;
            return Ok(req);
        }

        if req.arg.len() < info.input_size {
            tracing::warn!(
                "{}: short read, got {} bytes, want {}",
                info.name,
                req.arg.len(),
                info.input_size
            );
            req.status = Status::EIO;
            return Ok(req);
        }

        let mut rest = &req.arg[info.input_size..];
        for _ in 0..info.file_names {
            let Some(end) = rest.iter().position(|&b| b == 0) else {
                tracing::warn!("{}: missing name terminator", info.name);
                req.status = Status::EIO;
                return Ok(req);
            };
            match std::str::from_utf8(&rest[..end]) {
                Ok(name) => req.filenames.push(name),
                Err(_) => {
                    req.status = Status::EINVAL;
                    return Ok(req);
                }
            }
            rest = &rest[end + 1..];
        }
        req.flat_data = rest;
        Ok(req)
    }

    pub fn info(&self) -> Option<OpInfo> {
        self.opcode.map(Opcode::info)
    }

    pub fn context(&self) -> Context {
        Context::from(&self.header)
    }

    /// Decode the fixed input struct.
    pub fn input<T: FromBytes>(&self) -> Option<T> {
        T::read_from_prefix(self.arg)
    }

    pub fn filename(&self, index: usize) -> &'a str {
        self.filenames.get(index).copied().unwrap_or("")
    }

    pub fn filenames(&self) -> &[&'a str] {
        &self.filenames
    }

    /// Unstructured bytes after the fixed input and names.
    pub fn flat_data(&self) -> &'a [u8] {
        self.flat_data
    }

    pub fn set_output<T: AsBytes>(&mut self, out: &T) {
        let bytes = out.as_bytes();
        debug_assert!(
            self.info().map_or(true, |info| info.output_size == bytes.len()),
            "output size mismatch for {:?}",
            self.opcode
        );
        self.out_data.clear();
        self.out_data.extend_from_slice(bytes);
    }

    /// Drop the fixed output, for replies that carry only flat data.
    pub fn clear_output(&mut self) {
        self.out_data.clear();
    }

    pub fn set_flat_output(&mut self, data: Vec<u8>) {
        self.flat_out = data;
        self.flat_out_pooled = false;
    }

    /// Like `set_flat_output`, for a buffer that must go back to the pool.
    pub fn set_pooled_flat_output(&mut self, data: Vec<u8>) {
        self.flat_out = data;
        self.flat_out_pooled = true;
    }

    /// Hands back a pooled flat output buffer, if any.
    pub fn take_pooled_buffer(&mut self) -> Option<Vec<u8>> {
        if self.flat_out_pooled {
            self.flat_out_pooled = false;
            Some(std::mem::take(&mut self.flat_out))
        } else {
            None
        }
    }

    pub fn expects_reply(&self) -> bool {
        self.opcode.map_or(true, Opcode::expects_reply)
    }

    /// Reply header followed by the body slices.
    ///
    /// On error the body is empty.
    pub fn reply_parts(&self) -> (OutHeader, &[u8], &[u8]) {
        let (out, flat): (&[u8], &[u8]) = if self.status.ok() {
            (&self.out_data, &self.flat_out)
        } else {
            (&[], &[])
        };
        let header = OutHeader {
            length: (size_of::<OutHeader>() + out.len() + flat.len()) as u32,
            status: self.status.wire_value(),
            unique: self.header.unique,
        };
        (header, out, flat)
    }

    /// The complete reply as one contiguous message.
    pub fn serialize(&self) -> Vec<u8> {
        let (header, out, flat) = self.reply_parts();
        let mut buf = Vec::with_capacity(header.length as usize);
        buf.extend_from_slice(header.as_bytes());
        buf.extend_from_slice(out);
        buf.extend_from_slice(flat);
        buf
    }

    pub fn input_debug(&self) -> String {
        let name = self
            .opcode
            .map_or_else(|| format!("OPCODE-{}", self.header.opcode), |op| op.to_string());
        let mut s = format!(
            "Dispatch {}: {}, node {}",
            self.header.unique, name, self.header.node_id
        );
        if !self.filenames.is_empty() {
            s.push_str(&format!(" names: {:?}", self.filenames));
        }
        if !self.flat_data.is_empty() {
            s.push_str(&format!(" {} bytes", self.flat_data.len()));
        }
        s
    }

    pub fn output_debug(&self) -> String {
        let name = self.opcode.map_or("UNKNOWN", Opcode::name);
        let mut s = format!(
            "Serialize {}: {} code: {}",
            self.header.unique, name, self.status
        );
        if self.status.ok() {
            if self.opcode.is_some_and(|op| op.info().file_name_out) {
                s.push_str(&format!(
                    " {:?}",
                    String::from_utf8_lossy(&self.flat_out)
                ));
            } else if !self.flat_out.is_empty() {
                s.push_str(&format!(" {} bytes data", self.flat_out.len()));
            }
        }
        s
    }
}

/// Build an unsolicited notification message.
pub fn notify_message<T: AsBytes>(code: i32, body: &T, extra: &[u8]) -> Vec<u8> {
    let body = body.as_bytes();
    let header = OutHeader {
        length: (size_of::<OutHeader>() + body.len() + extra.len()) as u32,
        status: code,
        unique: 0,
    };
    let mut buf = Vec::with_capacity(header.length as usize);
    buf.extend_from_slice(header.as_bytes());
    buf.extend_from_slice(body);
    buf.extend_from_slice(extra);
    buf
}

/// Build a request message, as the kernel would send it.
pub fn encode_request<T: AsBytes>(header: InHeader, input: &T, trailer: &[u8]) -> Vec<u8> {
    let body = input.as_bytes();
    let header = InHeader {
        length: (size_of::<InHeader>() + body.len() + trailer.len()) as u32,
        ..header
    };
    let mut buf = Vec::with_capacity(header.length as usize);
    buf.extend_from_slice(header.as_bytes());
    buf.extend_from_slice(body);
    buf.extend_from_slice(trailer);
    buf
}
