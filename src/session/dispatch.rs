//! Per-opcode decoding of request inputs and encoding of outputs.

use std::mem::size_of;
use std::sync::atomic::Ordering;

use zerocopy::FromBytes;

use crate::raw::*;
use crate::request::Request;
use crate::session::MountState;

/// Init flags we accept from the kernel.
const SUPPORTED_INIT_FLAGS: u32 = FUSE_ASYNC_READ | FUSE_BIG_WRITES;

/// Fixed input of a request. `Request::parse` already checked the size.
fn input<T: FromBytes + Default>(req: &Request<'_>) -> T {
    req.input::<T>().unwrap_or_default()
}

impl MountState {
    pub(super) fn dispatch(&self, req: &mut Request<'_>) {
        let Some(op) = req.opcode else {
            req.status = Status::ENOSYS;
            return;
        };
        let header = req.header;
        let fs = self.raw_fs.as_ref();

        match op {
            Opcode::Init => self.do_init(req),
            Opcode::Destroy => fs.destroy(),
            Opcode::Lookup => {
                let mut out = EntryOut::default();
                req.status = fs.lookup(&header, req.filename(0), &mut out);
                req.set_output(&out);
            }
            Opcode::Forget => {
                let input: ForgetIn = input(req);
                fs.forget(header.node_id, input.nlookup);
            }
            Opcode::BatchForget => {
                let input: BatchForgetIn = input(req);
                let entries = req
                    .flat_data()
                    .chunks_exact(size_of::<ForgetOne>())
                    .take(input.count as usize);
                for entry in entries.filter_map(ForgetOne::read_from) {
                    fs.forget(entry.node_id, entry.nlookup);
                }
            }
            Opcode::GetAttr => {
                let input: GetAttrIn = input(req);
                let mut out = AttrOut::default();
                req.status = fs.getattr(&header, &input, &mut out);
                req.set_output(&out);
            }
            Opcode::SetAttr => {
                let input: SetAttrIn = input(req);
                let mut out = AttrOut::default();
                req.status = fs.setattr(&header, &input, &mut out);
                req.set_output(&out);
            }
            Opcode::Readlink => match fs.readlink(&header) {
                Ok(target) => req.set_flat_output(target),
                Err(status) => req.status = status,
            },
            Opcode::Mknod => {
                let input: MknodIn = input(req);
                let mut out = EntryOut::default();
                req.status = fs.mknod(&header, &input, req.filename(0), &mut out);
                req.set_output(&out);
            }
            Opcode::Mkdir => {
                let input: MkdirIn = input(req);
                let mut out = EntryOut::default();
                req.status = fs.mkdir(&header, &input, req.filename(0), &mut out);
                req.set_output(&out);
            }
            Opcode::Unlink => req.status = fs.unlink(&header, req.filename(0)),
            Opcode::Rmdir => req.status = fs.rmdir(&header, req.filename(0)),
            Opcode::Symlink => {
                let mut out = EntryOut::default();
                req.status = fs.symlink(&header, req.filename(0), req.filename(1), &mut out);
                req.set_output(&out);
            }
            Opcode::Rename => {
                let input: RenameIn = input(req);
                req.status = fs.rename(&header, &input, req.filename(0), req.filename(1));
            }
            Opcode::Link => {
                let input: LinkIn = input(req);
                let mut out = EntryOut::default();
                req.status = fs.link(&header, &input, req.filename(0), &mut out);
                req.set_output(&out);
            }
            Opcode::Open => {
                let input: OpenIn = input(req);
                let mut out = OpenOut::default();
                req.status = fs.open(&header, &input, &mut out);
                req.set_output(&out);
            }
            Opcode::Create => {
                let input: CreateIn = input(req);
                let mut out = CreateOut::default();
                req.status = fs.create(&header, &input, req.filename(0), &mut out);
                req.set_output(&out);
            }
            Opcode::Read => {
                let input: ReadIn = input(req);
                let mut buf = self.buffers.alloc_buffer(input.size as usize);
                match fs.read(&header, &input, &mut buf) {
                    Ok(n) => {
                        buf.truncate(n);
                        req.set_pooled_flat_output(buf);
                    }
                    Err(status) => {
                        self.buffers.return_buffer(buf);
                        req.status = status;
                    }
                }
            }
            Opcode::Write => {
                let input: WriteIn = input(req);
                let data = req.flat_data();
                let data = &data[..data.len().min(input.size as usize)];
                match fs.write(&header, &input, data) {
                    Ok(size) => req.set_output(&WriteOut { size, padding: 0 }),
                    Err(status) => req.status = status,
                }
            }
            Opcode::Release => {
                let input: ReleaseIn = input(req);
                fs.release(&header, &input);
            }
            Opcode::Flush => {
                let input: FlushIn = input(req);
                req.status = fs.flush(&header, &input);
            }
            Opcode::Fsync => {
                let input: FsyncIn = input(req);
                req.status = fs.fsync(&header, &input);
            }
            Opcode::OpenDir => {
                let input: OpenIn = input(req);
                let mut out = OpenOut::default();
                req.status = fs.opendir(&header, &input, &mut out);
                req.set_output(&out);
            }
            Opcode::ReadDir => {
                let input: ReadIn = input(req);
                let mut list = DirEntryList::new(input.size as usize, input.offset);
                req.status = fs.readdir(&header, &input, &mut list);
                req.set_flat_output(list.into_bytes());
            }
            Opcode::ReleaseDir => {
                let input: ReleaseIn = input(req);
                fs.releasedir(&header, &input);
            }
            Opcode::FsyncDir => {
                let input: FsyncIn = input(req);
                req.status = fs.fsyncdir(&header, &input);
            }
            Opcode::Statfs => {
                let mut out = StatfsOut::default();
                req.status = fs.statfs(&header, &mut out);
                req.set_output(&out);
            }
            Opcode::SetXAttr => {
                let input: SetXAttrIn = input(req);
                let data = req.flat_data();
                let data = &data[..data.len().min(input.size as usize)];
                req.status = fs.setxattr(&header, &input, req.filename(0), data);
            }
            Opcode::GetXAttr => {
                let input: GetXAttrIn = input(req);
                let result = fs.getxattr(&header, req.filename(0));
                xattr_reply(req, input.size, result);
            }
            Opcode::ListXAttr => {
                let input: GetXAttrIn = input(req);
                let result = fs.listxattr(&header);
                xattr_reply(req, input.size, result);
            }
            Opcode::RemoveXAttr => req.status = fs.removexattr(&header, req.filename(0)),
            Opcode::Access => {
                let input: AccessIn = input(req);
                req.status = fs.access(&header, &input);
            }
            Opcode::GetLk => {
                let input: LkIn = input(req);
                let mut out = LkOut::default();
                req.status = fs.getlk(&header, &input, &mut out);
                req.set_output(&out);
            }
            Opcode::SetLk | Opcode::SetLkw => {
                let input: LkIn = input(req);
                req.status = fs.setlk(&header, &input, op == Opcode::SetLkw);
            }
            Opcode::Bmap => {
                let input: BmapIn = input(req);
                let mut out = BmapOut::default();
                req.status = fs.bmap(&header, &input, &mut out);
                req.set_output(&out);
            }
            Opcode::Interrupt => {
                let input: InterruptIn = input(req);
                tracing::debug!("Ignoring interrupt of request {}", input.unique);
            }
            Opcode::Ioctl | Opcode::Poll | Opcode::NotifyReply => req.status = Status::ENOSYS,
        }
    }

    fn do_init(&self, req: &mut Request<'_>) {
        let input: InitIn = input(req);
        if input.major != FUSE_KERNEL_VERSION || input.minor < FUSE_KERNEL_MINOR_VERSION {
            tracing::error!(
                "Unsupported kernel protocol {}.{}, need {}.{}",
                input.major,
                input.minor,
                FUSE_KERNEL_VERSION,
                FUSE_KERNEL_MINOR_VERSION
            );
            req.status = Status::EIO;
            return;
        }

        *self.kernel_settings.lock() = input;
        self.kernel_minor
            .store(FUSE_KERNEL_MINOR_VERSION.min(input.minor), Ordering::Release);

        let max_background = self.options.max_background.min(u16::MAX as usize) as u16;
        let out = InitOut {
            major: FUSE_KERNEL_VERSION,
            minor: FUSE_KERNEL_MINOR_VERSION,
            max_readahead: input.max_readahead,
            flags: input.flags & SUPPORTED_INIT_FLAGS,
            max_background,
            congestion_threshold: max_background / 4 * 3,
            max_write: self.options.max_write as u32,
        };
        req.set_output(&out);
    }
}

/// Size queries (`size == 0`) get the length; otherwise the data itself.
fn xattr_reply(req: &mut Request<'_>, size: u32, result: Result<Vec<u8>, Status>) {
    match result {
        Ok(data) if size == 0 => req.set_output(&GetXAttrOut {
            size: data.len() as u32,
            padding: 0,
        }),
        Ok(data) if data.len() > size as usize => req.status = Status::ERANGE,
        Ok(data) => {
            req.clear_output();
            req.set_flat_output(data);
        }
        Err(status) => req.status = status,
    }
}
