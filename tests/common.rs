use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use nodefuse::raw::{InHeader, InitIn, InitOut, Opcode, OutHeader, FUSE_ROOT_ID};
use nodefuse::request::encode_request;
use nodefuse::session::Transport;
use nodefuse::{MountOptions, MountState, RawFileSystem};
use zerocopy::{AsBytes, FromBytes};

/// How long a test waits for a reply before giving up.
#[allow(dead_code)]
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Get the path to the nodefuse binary for testing.
#[allow(dead_code)]
pub fn get_nodefuse_path() -> PathBuf {
    assert_cmd::cargo::cargo_bin!("nodefuse").to_path_buf()
}

/// A kernel channel in memory: requests are fed through a channel, replies
/// and notifications are collected.
pub struct MemTransport {
    incoming: Mutex<Receiver<Vec<u8>>>,
    written: Mutex<Vec<Vec<u8>>>,
    arrived: Condvar,
}

impl MemTransport {
    pub fn new() -> (Arc<Self>, Sender<Vec<u8>>) {
        let (tx, rx) = mpsc::channel();
        let transport = Arc::new(MemTransport {
            incoming: Mutex::new(rx),
            written: Mutex::new(Vec::new()),
            arrived: Condvar::new(),
        });
        (transport, tx)
    }

    /// Wait for the reply to request `unique` and take it.
    pub fn wait_reply(&self, unique: u64) -> Option<Reply> {
        let deadline = Instant::now() + REPLY_TIMEOUT;
        let mut written = self.written.lock().unwrap();
        loop {
            let found = written
                .iter()
                .position(|msg| OutHeader::read_from_prefix(&msg[..]).is_some_and(|h| h.unique == unique));
            if let Some(index) = found {
                return Some(Reply::new(written.remove(index)));
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            written = self.arrived.wait_timeout(written, deadline - now).unwrap().0;
        }
    }

    /// Notifications written so far.
    #[allow(dead_code)]
    pub fn notifications(&self) -> Vec<Reply> {
        self.written
            .lock()
            .unwrap()
            .iter()
            .filter(|msg| OutHeader::read_from_prefix(&msg[..]).is_some_and(|h| h.unique == 0))
            .map(|msg| Reply::new(msg.clone()))
            .collect()
    }

    #[allow(dead_code)]
    pub fn written_count(&self) -> usize {
        self.written.lock().unwrap().len()
    }
}

impl Transport for MemTransport {
    fn read_message(&self, buf: &mut [u8]) -> io::Result<usize> {
        let msg = match self.incoming.lock().unwrap().recv() {
            Ok(msg) => msg,
            // All senders gone: the kernel hung up.
            Err(_) => return Ok(0),
        };
        buf[..msg.len()].copy_from_slice(&msg);
        Ok(msg.len())
    }

    fn write_message(&self, parts: &[&[u8]]) -> io::Result<()> {
        let msg: Vec<u8> = parts.concat();
        self.written.lock().unwrap().push(msg);
        self.arrived.notify_all();
        Ok(())
    }
}

/// One message written by the session.
#[derive(Debug, Clone)]
pub struct Reply {
    pub header: OutHeader,
    pub body: Vec<u8>,
}

#[allow(dead_code)]
impl Reply {
    fn new(msg: Vec<u8>) -> Self {
        let header = OutHeader::read_from_prefix(&msg[..]).unwrap();
        assert_eq!(header.length as usize, msg.len(), "length field mismatch");
        Reply {
            header,
            body: msg[std::mem::size_of::<OutHeader>()..].to_vec(),
        }
    }

    pub fn status(&self) -> i32 {
        self.header.status
    }

    pub fn out<T: FromBytes>(&self) -> T {
        T::read_from_prefix(&self.body[..]).expect("reply body too short")
    }
}

/// A session served on a background thread over a [`MemTransport`].
pub struct TestSession {
    pub state: Arc<MountState>,
    pub transport: Arc<MemTransport>,
    sender: Option<Sender<Vec<u8>>>,
    server: Option<JoinHandle<nodefuse::Result<()>>>,
    next_unique: AtomicU64,
}

#[allow(dead_code)]
impl TestSession {
    pub fn start(fs: Arc<dyn RawFileSystem>) -> Self {
        Self::with_options(fs, MountOptions::default())
    }

    pub fn with_options(fs: Arc<dyn RawFileSystem>, options: MountOptions) -> Self {
        let state = Arc::new(MountState::new(fs, options).expect("Failed to create session"));
        let (transport, sender) = MemTransport::new();
        state
            .attach(transport.clone(), None)
            .expect("Failed to attach transport");

        let serving = state.clone();
        let server = thread::spawn(move || serving.serve());
        TestSession {
            state,
            transport,
            sender: Some(sender),
            server: Some(server),
            next_unique: AtomicU64::new(1),
        }
    }

    /// Queue a request and return its unique id.
    pub fn send<T: AsBytes>(&self, opcode: Opcode, node_id: u64, input: &T, trailer: &[u8]) -> u64 {
        let unique = self.next_unique.fetch_add(1, Ordering::Relaxed);
        let header = InHeader {
            opcode: opcode as u32,
            unique,
            node_id,
            uid: 1000,
            gid: 1000,
            pid: 42,
            ..Default::default()
        };
        let msg = encode_request(header, input, trailer);
        self.sender
            .as_ref()
            .expect("session already finished")
            .send(msg)
            .expect("server thread gone");
        unique
    }

    /// Send a request and wait for its reply.
    pub fn call<T: AsBytes>(&self, opcode: Opcode, node_id: u64, input: &T, trailer: &[u8]) -> Reply {
        let unique = self.send(opcode, node_id, input, trailer);
        self.transport
            .wait_reply(unique)
            .unwrap_or_else(|| panic!("no reply to {:?} (unique {})", opcode, unique))
    }

    /// Handshake as a 7.12 kernel would.
    pub fn init(&self) -> InitOut {
        let reply = self.call(
            Opcode::Init,
            FUSE_ROOT_ID,
            &InitIn {
                major: 7,
                minor: 12,
                max_readahead: 128 * 1024,
                flags: 0,
            },
            &[],
        );
        assert_eq!(reply.status(), 0, "INIT failed");
        reply.out()
    }

    /// Hang up and wait for the serve loop to return.
    pub fn finish(mut self) -> nodefuse::Result<()> {
        self.sender.take();
        self.server
            .take()
            .expect("serve thread already joined")
            .join()
            .expect("serve thread panicked")
    }
}

impl Drop for TestSession {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(server) = self.server.take() {
            let _ = server.join();
        }
    }
}

/// Poll `cond` until it holds or the reply timeout passes.
#[allow(dead_code)]
pub fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + REPLY_TIMEOUT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

/// NUL-terminated name as the kernel sends it.
#[allow(dead_code)]
pub fn name(s: &str) -> Vec<u8> {
    let mut v = s.as_bytes().to_vec();
    v.push(0);
    v
}

/// Names in a READDIR reply body.
#[allow(dead_code)]
pub fn dirent_names(body: &[u8]) -> Vec<String> {
    use nodefuse::raw::Dirent;
    let fixed = std::mem::size_of::<Dirent>();
    let mut names = Vec::new();
    let mut rest = body;
    while rest.len() >= fixed {
        let dirent = Dirent::read_from_prefix(rest).unwrap();
        let len = dirent.namelen as usize;
        names.push(String::from_utf8(rest[fixed..fixed + len].to_vec()).unwrap());
        let padded = (fixed + len + 7) & !7;
        rest = &rest[padded.min(rest.len())..];
    }
    names
}
