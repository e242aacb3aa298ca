//! The mount session: owns the kernel channel, reads requests, runs each
//! one on the blocking pool and writes the replies.

mod dispatch;
pub mod fusermount;
mod latency;
mod notify;
mod transport;

use std::any::Any;
use std::mem::size_of;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicU32;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::runtime::{Handle, Runtime};
use zerocopy::{AsBytes, FromBytes};

pub use latency::{LatencyMap, LatencyStat};
pub use notify::Notifier;
pub use transport::{DeviceTransport, Transport};

use crate::bufferpool::{BufferPool, GcBufferPool, PooledBufferPool};
use crate::config::MountOptions;
use crate::error::{FuseError, Result};
use crate::raw::{InHeader, InitIn, Opcode, OutHeader, Status, PAGE_SIZE};
use crate::rawfs::RawFileSystem;
use crate::request::Request;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unmounted,
    Mounting,
    Running,
    Unmounting,
}

/// One mounted filesystem and its connection to the kernel.
pub struct MountState {
    raw_fs: Arc<dyn RawFileSystem>,
    options: MountOptions,
    buffers: Arc<dyn BufferPool>,
    buffer_size: usize,
    latencies: Option<LatencyMap>,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    mount_point: Mutex<Option<PathBuf>>,
    state: Mutex<SessionState>,
    kernel_minor: Arc<AtomicU32>,
    kernel_settings: Mutex<InitIn>,
    /// First invariant violation seen by a request task.
    fatal: Mutex<Option<String>>,
    runtime: Handle,
    owned_runtime: Option<Runtime>,
}

impl MountState {
    /// Create a session for `raw_fs`.
    ///
    /// Request tasks run on the ambient tokio runtime when there is one,
    /// otherwise on a runtime owned by the session.
    pub fn new(raw_fs: Arc<dyn RawFileSystem>, options: MountOptions) -> Result<Self> {
        let (runtime, owned) = match Handle::try_current() {
            Ok(handle) => (handle, None),
            Err(_) => {
                let rt = tokio::runtime::Builder::new_multi_thread()
                    .thread_name("nodefuse-worker")
                    .enable_all()
                    .build()?;
                (rt.handle().clone(), Some(rt))
            }
        };

        let buffers: Arc<dyn BufferPool> = if options.buffer_pooling {
            Arc::new(PooledBufferPool::new())
        } else {
            Arc::new(GcBufferPool)
        };

        Ok(MountState {
            raw_fs,
            buffer_size: options.max_write + PAGE_SIZE,
            latencies: options.latency.then(LatencyMap::new),
            options,
            buffers,
            transport: RwLock::new(None),
            mount_point: Mutex::new(None),
            state: Mutex::new(SessionState::Unmounted),
            kernel_minor: Arc::new(AtomicU32::new(0)),
            kernel_settings: Mutex::new(InitIn::default()),
            fatal: Mutex::new(None),
            runtime,
            owned_runtime: owned,
        })
    }

    pub fn options(&self) -> &MountOptions {
        &self.options
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn mount_point(&self) -> Option<PathBuf> {
        self.mount_point.lock().clone()
    }

    /// What the kernel announced in its INIT request.
    pub fn kernel_settings(&self) -> InitIn {
        *self.kernel_settings.lock()
    }

    pub fn latencies(&self) -> Option<&LatencyMap> {
        self.latencies.as_ref()
    }

    pub fn buffer_stats(&self) -> String {
        self.buffers.stats()
    }

    /// Mount at `mount_point` through `fusermount`.
    pub fn mount(&self, mount_point: &Path) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != SessionState::Unmounted {
                return Err(FuseError::Mount(format!("session is {:?}", *state)));
            }
            *state = SessionState::Mounting;
        }

        let result = mount_point
            .canonicalize()
            .map_err(FuseError::from)
            .and_then(|abs| fusermount::mount(&abs, &self.options).map(|file| (abs, file)));
        match result {
            Ok((abs, file)) => {
                tracing::info!("Mounted {}", abs.display());
                self.start(Arc::new(DeviceTransport::new(file)), Some(abs));
                Ok(())
            }
            Err(err) => {
                *self.state.lock() = SessionState::Unmounted;
                Err(err)
            }
        }
    }

    /// Serve over an already established channel.
    pub fn attach(&self, transport: Arc<dyn Transport>, mount_point: Option<PathBuf>) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != SessionState::Unmounted {
                return Err(FuseError::Mount(format!("session is {:?}", *state)));
            }
            *state = SessionState::Mounting;
        }
        self.start(transport, mount_point);
        Ok(())
    }

    fn start(&self, transport: Arc<dyn Transport>, mount_point: Option<PathBuf>) {
        *self.transport.write() = Some(transport.clone());
        *self.mount_point.lock() = mount_point;
        self.raw_fs
            .init(Notifier::new(transport, self.kernel_minor.clone()));
        *self.state.lock() = SessionState::Running;
    }

    /// Unmount, retrying while the mount point is busy.
    pub fn unmount(&self) -> Result<()> {
        let mount_point = {
            let mut state = self.state.lock();
            if *state != SessionState::Running {
                return Err(FuseError::Mount(format!("session is {:?}", *state)));
            }
            *state = SessionState::Unmounting;
            self.mount_point.lock().clone()
        };

        let result = match &mount_point {
            Some(path) => fusermount::unmount(path),
            None => Ok(()),
        };
        match result {
            Ok(()) => {
                self.raw_fs.destroy();
                self.transport.write().take();
                *self.mount_point.lock() = None;
                *self.state.lock() = SessionState::Unmounted;
                tracing::info!("Unmounted");
                Ok(())
            }
            Err(err) => {
                *self.state.lock() = SessionState::Running;
                Err(err)
            }
        }
    }

    /// Read and dispatch requests until the channel goes away.
    ///
    /// Blocks the calling thread. Returns an error on a fatal read error or
    /// when a request task hit a broken invariant.
    pub fn serve(self: &Arc<Self>) -> Result<()> {
        let transport = self
            .transport
            .read()
            .clone()
            .ok_or_else(|| FuseError::Mount("serve called before mount".to_string()))?;

        let result = loop {
            if self.fatal.lock().is_some() {
                break Ok(());
            }
            let mut buf = self.buffers.alloc_buffer(self.buffer_size);
            match transport.read_message(&mut buf) {
                Ok(0) => {
                    self.buffers.return_buffer(buf);
                    break Ok(());
                }
                Ok(n) => {
                    buf.truncate(n);
                    let this = Arc::clone(self);
                    self.runtime.spawn_blocking(move || this.handle_message(buf));
                }
                Err(err) => {
                    self.buffers.return_buffer(buf);
                    match err.raw_os_error() {
                        // Request was interrupted before we read it.
                        Some(libc::ENOENT) | Some(libc::EINTR) | Some(libc::EAGAIN) => continue,
                        Some(libc::ENODEV) => {
                            tracing::debug!("Device gone, leaving serve loop");
                            break Ok(());
                        }
                        _ => {
                            tracing::error!("Reading from the kernel channel: {}", err);
                            break Err(FuseError::Io(err));
                        }
                    }
                }
            }
        };
        drop(transport);
        // The filesystem drops its notifier, the last other handle on the
        // channel.
        self.raw_fs.destroy();

        {
            let mut state = self.state.lock();
            if *state == SessionState::Running {
                *state = SessionState::Unmounted;
                self.transport.write().take();
                *self.mount_point.lock() = None;
            }
        }

        if let Some(msg) = self.fatal.lock().clone() {
            return Err(FuseError::InvariantViolation(msg));
        }
        result
    }

    fn handle_message(&self, buf: Vec<u8>) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.handle_request(&buf)));
        if let Err(payload) = outcome {
            let msg = panic_message(payload.as_ref());
            tracing::error!("Request handler panicked: {}", msg);
            self.fatal.lock().get_or_insert(msg);

            if let Some(header) = InHeader::read_from_prefix(&buf[..]) {
                let wants_reply = Opcode::from_u32(header.opcode).map_or(true, Opcode::expects_reply);
                if wants_reply {
                    let out = OutHeader {
                        length: size_of::<OutHeader>() as u32,
                        status: Status::EIO.wire_value(),
                        unique: header.unique,
                    };
                    self.write(&[out.as_bytes()]);
                }
            }
        }
        self.buffers.return_buffer(buf);
    }

    fn handle_request(&self, input: &[u8]) {
        let mut req = match Request::parse(input) {
            Ok(req) => req,
            Err(err) => {
                tracing::warn!("Dropping message: {}", err);
                return;
            }
        };

        if self.options.debug {
            tracing::debug!("{}", req.input_debug());
        }
        if req.status.ok() {
            self.dispatch(&mut req);
        }

        if req.expects_reply() {
            if self.options.debug {
                tracing::debug!("{}", req.output_debug());
            }
            let (header, out, flat) = req.reply_parts();
            self.write(&[header.as_bytes(), out, flat]);
        }
        if let Some(buf) = req.take_pooled_buffer() {
            self.buffers.return_buffer(buf);
        }

        if let Some(latencies) = &self.latencies {
            let name = req.opcode.map_or("UNKNOWN", Opcode::name);
            latencies.add(name, req.start.elapsed());
        }
    }

    fn write(&self, parts: &[&[u8]]) {
        let Some(transport) = self.transport.read().clone() else {
            return;
        };
        if let Err(err) = transport.write_message(parts) {
            if err.raw_os_error() == Some(libc::ENOENT) {
                tracing::debug!("Reply to an interrupted request dropped");
            } else {
                tracing::error!("Writing reply: {}", err);
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl Drop for MountState {
    fn drop(&mut self) {
        if *self.state.get_mut() == SessionState::Running && self.mount_point.get_mut().is_some() {
            if let Err(err) = self.unmount() {
                tracing::warn!("Unmount on drop failed: {}", err);
            }
        }
        // The last reference may go away on one of the runtime's own threads.
        if let Some(rt) = self.owned_runtime.take() {
            rt.shutdown_background();
        }
    }
}
