use crate::abi::{self, abi_for_version, BinderAbi, Command, TransactionFlags, TxArgs};
use crate::buffer::{next_command, IoBuf, KernelBuffer, ReadBuf};
use crate::object::{
    LocalObject, ObjectRegistry, RemoteObject, TransactionHandler, TransactionSupport,
};
use crate::protocol::{protocol_for_device, RpcProtocol};
use crate::reply::{LocalReply, RemoteReply};
use crate::request::{LocalRequest, RemoteRequest};
use crate::{status, Error};

use byteorder::{ByteOrder, LittleEndian};
use nix::errno::Errno;
use nix::fcntl::{open, OFlag};
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd::{close, sysconf, SysconfVar};

use std::ffi::c_void;
use std::os::unix::io::RawFd;
use std::ptr;
use std::sync::Arc;

/// Zero leaves the thread-count decision to the driver.
const DEFAULT_MAX_BINDER_THREADS: u32 = 0;

fn vm_size() -> usize {
    let page = sysconf(SysconfVar::PAGE_SIZE)
        .ok()
        .flatten()
        .unwrap_or(0x1000) as usize;
    (1024 * 1024) - 2 * page
}

struct Inner {
    dev: String,
    fd: RawFd,
    vm: *mut c_void,
    vmsize: usize,
    io: &'static BinderAbi,
    protocol: &'static dyn RpcProtocol,
}

// The mapping is only ever written by the kernel and read here; the
// descriptor is shared the same way it would be across fork.
unsafe impl Send for Inner {}
unsafe impl Sync for Inner {}

impl Drop for Inner {
    fn drop(&mut self) {
        debug!("Closing {}", self.dev);
        if !self.vm.is_null() {
            let _ = unsafe { munmap(self.vm, self.vmsize) };
        }
        let _ = close(self.fd);
    }
}

/// A session on one binder device: the open descriptor, the receive
/// mapping and the ABI adapter negotiated at open time. Cheap to clone;
/// the last clone dropped unmaps the receive region and closes the
/// descriptor.
#[derive(Clone)]
pub struct Driver {
    inner: Arc<Inner>,
}

impl Driver {
    /// Opens a binder device and negotiates the kernel ABI.
    pub fn open(dev: &str) -> Result<Self, Error> {
        let fd = open(dev, OFlag::O_RDWR | OFlag::O_CLOEXEC, Mode::empty()).map_err(|err| {
            error!("Can't open {}: {}", dev, err);
            Error::Open {
                dev: dev.to_string(),
                err,
            }
        })?;
        match Self::setup(dev, fd) {
            Ok(driver) => Ok(driver),
            Err(err) => {
                let _ = close(fd);
                Err(err)
            }
        }
    }

    fn setup(dev: &str, fd: RawFd) -> Result<Self, Error> {
        let mut version = 0i32;
        unsafe { abi::binder_version(fd, &mut version) }.map_err(|err| {
            error!("Can't get binder version from {}: {}", dev, err);
            Error::Version {
                dev: dev.to_string(),
                err,
            }
        })?;
        debug!("Opened {} version {}", dev, version);

        let io = abi_for_version(version).ok_or_else(|| {
            error!("{} unexpected version {}", dev, version);
            Error::UnsupportedVersion {
                dev: dev.to_string(),
                version,
            }
        })?;

        // A chunk of virtual address space for the driver to deliver
        // transactions into. User code never writes there.
        let vmsize = vm_size();
        let vm = unsafe {
            mmap(
                ptr::null_mut(),
                vmsize,
                ProtFlags::PROT_READ,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_NORESERVE,
                fd,
                0,
            )
        }
        .map_err(|err| {
            error!("{} failed to mmap: {}", dev, err);
            Error::Mmap {
                dev: dev.to_string(),
                err,
            }
        })?;

        let max_threads = DEFAULT_MAX_BINDER_THREADS;
        if let Err(err) = unsafe { abi::binder_set_max_threads(fd, &max_threads) } {
            error!("{} failed to set max threads ({}): {}", dev, max_threads, err);
        }

        Ok(Self {
            inner: Arc::new(Inner {
                dev: dev.to_string(),
                fd,
                vm,
                vmsize,
                io,
                protocol: protocol_for_device(dev),
            }),
        })
    }

    pub fn dev(&self) -> &str {
        &self.inner.dev
    }

    pub fn fd(&self) -> RawFd {
        self.inner.fd
    }

    pub fn io(&self) -> &'static BinderAbi {
        self.inner.io
    }

    fn protocol(&self) -> &'static dyn RpcProtocol {
        self.inner.protocol
    }

    /// Blocks until the driver descriptor (or the optional auxiliary
    /// descriptor, the cancellation path) becomes readable. Returns the
    /// revents of both.
    pub fn poll(&self, aux: Option<RawFd>) -> Result<(PollFlags, PollFlags), Errno> {
        let events =
            PollFlags::POLLIN | PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL;
        let mut fds = vec![PollFd::new(self.inner.fd, events)];
        if let Some(fd) = aux {
            fds.push(PollFd::new(fd, PollFlags::POLLIN));
        }
        poll(&mut fds, -1)?;
        let driver_revents = fds[0].revents().unwrap_or_else(PollFlags::empty);
        let aux_revents = fds
            .get(1)
            .and_then(|fd| fd.revents())
            .unwrap_or_else(PollFlags::empty);
        Ok((driver_revents, aux_revents))
    }

    fn write(&self, buf: &mut IoBuf) -> Result<(), Errno> {
        loop {
            trace!("< {}/{}", buf.consumed, buf.size);
            match (self.inner.io.write_read)(self.inner.fd, Some(&mut *buf), None) {
                Err(Errno::EAGAIN) => continue,
                result => return result,
            }
        }
    }

    fn write_read(
        &self,
        mut write: Option<&mut IoBuf>,
        mut read: Option<&mut IoBuf>,
    ) -> Result<(), Errno> {
        loop {
            trace!(
                "write {}/{} read {}/{}",
                write.as_ref().map_or(0, |b| b.consumed),
                write.as_ref().map_or(0, |b| b.size),
                read.as_ref().map_or(0, |b| b.consumed),
                read.as_ref().map_or(0, |b| b.size)
            );
            match (self.inner.io.write_read)(
                self.inner.fd,
                write.as_deref_mut(),
                read.as_deref_mut(),
            ) {
                Err(Errno::EAGAIN) => continue,
                result => return result,
            }
        }
    }

    fn cmd(&self, cmd: u32) -> Result<(), Errno> {
        let mut data = [0u8; 4];
        LittleEndian::write_u32(&mut data, cmd);
        let mut write = IoBuf {
            ptr: data.as_ptr() as usize,
            size: data.len(),
            consumed: 0,
        };
        self.write(&mut write)
    }

    fn cmd_u32(&self, cmd: u32, param: u32) -> Result<(), Errno> {
        let mut data = [0u8; 8];
        LittleEndian::write_u32(&mut data[..4], cmd);
        LittleEndian::write_u32(&mut data[4..], param);
        let mut write = IoBuf {
            ptr: data.as_ptr() as usize,
            size: data.len(),
            consumed: 0,
        };
        self.write(&mut write)
    }

    /// Sends a command whose payload is echoed verbatim, as the refcount
    /// acknowledgements require.
    fn cmd_data(&self, cmd: u32, payload: &[u8]) -> Result<(), Errno> {
        let mut data = [0u8; 4 + abi::MAX_PTR_COOKIE_SIZE];
        LittleEndian::write_u32(&mut data[..4], cmd);
        data[4..4 + payload.len()].copy_from_slice(payload);
        let mut write = IoBuf {
            ptr: data.as_ptr() as usize,
            size: 4 + payload.len(),
            consumed: 0,
        };
        self.write(&mut write)
    }

    fn death_notification(&self, cmd: u32, obj: &dyn RemoteObject) -> Result<(), Errno> {
        let mut buf = [0u8; 4 + abi::MAX_DEATH_NOTIFICATION_SIZE];
        LittleEndian::write_u32(&mut buf[..4], cmd);
        let len = (self.inner.io.encode_death_notification)(&mut buf[4..], obj.handle());
        let mut write = IoBuf {
            ptr: buf.as_ptr() as usize,
            size: 4 + len,
            consumed: 0,
        };
        self.write(&mut write)
    }

    fn reply_status(&self, status: i32) -> Result<(), Errno> {
        let io = self.inner.io;
        let mut buf = [0u8; 4 + abi::MAX_BC_TRANSACTION_SIZE];
        LittleEndian::write_u32(&mut buf[..4], io.bc.reply);
        let len = (io.encode_status_reply)(&mut buf[4..], &status);
        trace!("< BC_REPLY ({})", status);
        let mut write = IoBuf {
            ptr: buf.as_ptr() as usize,
            size: 4 + len,
            consumed: 0,
        };
        self.write(&mut write)
    }

    fn reply_data(&self, reply: &LocalReply) -> Result<(), Errno> {
        let io = self.inner.io;
        let mut buf = [0u8; 4 + abi::MAX_BC_TRANSACTION_SG_SIZE];
        let mut offsets_buf = None;
        let buffers_size = reply.buffers_size();
        let args = TxArgs {
            target: 0,
            code: 0,
            flags: 0,
            data: reply.to_slice(),
            offsets: reply.offsets(),
        };
        let len = if buffers_size > 0 {
            trace!("< BC_REPLY_SG {} bytes", buffers_size);
            LittleEndian::write_u32(&mut buf[..4], io.bc.reply_sg);
            (io.encode_transaction_sg)(&mut buf[4..], &args, &mut offsets_buf, buffers_size)
        } else {
            trace!("< BC_REPLY");
            LittleEndian::write_u32(&mut buf[..4], io.bc.reply);
            (io.encode_transaction)(&mut buf[4..], &args, &mut offsets_buf)
        };
        let mut write = IoBuf {
            ptr: buf.as_ptr() as usize,
            size: 4 + len,
            consumed: 0,
        };
        self.write(&mut write)
    }

    /// Returns a kernel-lent transaction buffer to the driver. A null
    /// pointer is a no-op.
    pub fn free_buffer(&self, ptr: usize) -> Result<(), Errno> {
        if ptr == 0 {
            return Ok(());
        }
        let io = self.inner.io;
        trace!("< BC_FREE_BUFFER {:#x}", ptr);
        let mut buf = [0u8; 4 + abi::MAX_POINTER_SIZE];
        LittleEndian::write_u32(&mut buf[..4], io.bc.free_buffer);
        let len = (io.encode_pointer)(&mut buf[4..], ptr);
        let mut write = IoBuf {
            ptr: buf.as_ptr() as usize,
            size: 4 + len,
            consumed: 0,
        };
        self.write(&mut write)
    }

    pub fn enter_looper(&self) -> Result<(), Errno> {
        trace!("< BC_ENTER_LOOPER");
        self.cmd(self.inner.io.bc.enter_looper)
    }

    pub fn exit_looper(&self) -> Result<(), Errno> {
        trace!("< BC_EXIT_LOOPER");
        self.cmd(self.inner.io.bc.exit_looper)
    }

    pub fn increfs(&self, handle: u32) -> Result<(), Errno> {
        trace!("< BC_INCREFS {:#010x}", handle);
        self.cmd_u32(self.inner.io.bc.increfs, handle)
    }

    pub fn decrefs(&self, handle: u32) -> Result<(), Errno> {
        trace!("< BC_DECREFS {:#010x}", handle);
        self.cmd_u32(self.inner.io.bc.decrefs, handle)
    }

    pub fn acquire(&self, handle: u32) -> Result<(), Errno> {
        trace!("< BC_ACQUIRE {:#010x}", handle);
        self.cmd_u32(self.inner.io.bc.acquire, handle)
    }

    pub fn release(&self, handle: u32) -> Result<(), Errno> {
        trace!("< BC_RELEASE {:#010x}", handle);
        self.cmd_u32(self.inner.io.bc.release, handle)
    }

    pub fn request_death_notification(&self, obj: &dyn RemoteObject) -> Result<(), Errno> {
        trace!("< BC_REQUEST_DEATH_NOTIFICATION {:#010x}", obj.handle());
        self.death_notification(self.inner.io.bc.request_death_notification, obj)
    }

    pub fn clear_death_notification(&self, obj: &dyn RemoteObject) -> Result<(), Errno> {
        trace!("< BC_CLEAR_DEATH_NOTIFICATION {:#010x}", obj.handle());
        self.death_notification(self.inner.io.bc.clear_death_notification, obj)
    }

    /// Constructs a fresh outbound request prefixed with this device's
    /// RPC header.
    pub fn local_request_new(&self, iface: &str) -> Result<LocalRequest, Error> {
        let mut req = LocalRequest::new();
        self.protocol().write_rpc_header(&mut req, iface)?;
        Ok(req)
    }

    fn handle_transaction(
        &self,
        reg: &dyn ObjectRegistry,
        handler: Option<&dyn TransactionHandler>,
        data: &[u8],
    ) {
        let tx = unsafe { (self.inner.io.decode_transaction_data)(data) };
        trace!(
            "> BR_TRANSACTION {:#x} {:#010x} ({} bytes)",
            tx.target,
            tx.code,
            tx.size
        );
        let mut req = RemoteRequest::new(self.protocol(), tx.pid, tx.euid);
        let obj = reg.get_local(tx.target);
        let tx_is_one_way = tx.is_one_way();

        // The kernel buffer now belongs to the request; empty
        // transactions give it straight back.
        if tx.data_ptr != 0 && tx.size > 0 {
            req.set_data(
                KernelBuffer::new(self.clone(), tx.data_ptr, tx.size),
                tx.offsets,
            );
        } else if let Err(err) = self.free_buffer(tx.data_ptr) {
            warn!("failed to return empty transaction buffer: {}", err);
        }

        let mut reply: Option<LocalReply> = None;
        let mut status = -(Errno::EBADMSG as i32);
        let support = match &obj {
            Some(obj) => obj.can_handle_transaction(req.interface(), tx.code),
            None => TransactionSupport::Unhandled,
        };
        match (&obj, support) {
            (Some(obj), TransactionSupport::Looper) => {
                let (r, s) = obj.handle_looper_transaction(&mut req, tx.code, tx.flags);
                reply = r;
                status = s;
            }
            (Some(obj), TransactionSupport::Supported) => {
                if let Some(handler) = handler {
                    let (r, s) = handler.transact(obj.as_ref(), &mut req, tx.code, tx.flags);
                    reply = r;
                    status = s;
                }
            }
            _ => warn!("Unhandled transaction {:#010x}", tx.code),
        }

        if !tx_is_one_way {
            let sent = match &reply {
                Some(reply) => self.reply_data(reply),
                None => self.reply_status(status),
            };
            if let Err(err) = sent {
                warn!("failed to send reply: {}", err);
            }
        }
    }

    fn handle_command(
        &self,
        reg: &dyn ObjectRegistry,
        handler: Option<&dyn TransactionHandler>,
        cmd: u32,
        data: &[u8],
    ) {
        let io = self.inner.io;
        match io.command(cmd) {
            Command::Noop => trace!("> BR_NOOP"),
            Command::Ok => trace!("> BR_OK"),
            Command::TransactionComplete => trace!("> BR_TRANSACTION_COMPLETE"),
            Command::SpawnLooper => trace!("> BR_SPAWN_LOOPER"),
            Command::Finished => trace!("> BR_FINISHED"),
            Command::Increfs => {
                trace!("> BR_INCREFS");
                if let Some(obj) = reg.get_local((io.decode_binder_ptr_cookie)(data)) {
                    obj.handle_increfs();
                }
                trace!("< BC_INCREFS_DONE");
                if let Err(err) = self.cmd_data(io.bc.increfs_done, data) {
                    warn!("failed to acknowledge increfs: {}", err);
                }
            }
            Command::Acquire => {
                trace!("> BR_ACQUIRE");
                if let Some(obj) = reg.get_local((io.decode_binder_ptr_cookie)(data)) {
                    obj.handle_acquire();
                }
                trace!("< BC_ACQUIRE_DONE");
                if let Err(err) = self.cmd_data(io.bc.acquire_done, data) {
                    warn!("failed to acknowledge acquire: {}", err);
                }
            }
            Command::Decrefs => {
                trace!("> BR_DECREFS");
                if let Some(obj) = reg.get_local((io.decode_binder_ptr_cookie)(data)) {
                    obj.handle_decrefs();
                }
            }
            Command::Release => {
                trace!("> BR_RELEASE");
                if let Some(obj) = reg.get_local((io.decode_binder_ptr_cookie)(data)) {
                    obj.handle_release();
                }
            }
            Command::Transaction => self.handle_transaction(reg, handler, data),
            Command::DeadBinder => {
                let handle = (io.decode_cookie)(data) as u32;
                trace!("> BR_DEAD_BINDER {:#010x}", handle);
                if let Some(obj) = reg.get_remote(handle) {
                    obj.handle_death_notification();
                }
            }
            Command::ClearDeathNotificationDone => trace!("> BR_CLEAR_DEATH_NOTIFICATION_DONE"),
            Command::Reply | Command::DeadReply | Command::FailedReply => {
                warn!("Unexpected command {:#010x}", cmd)
            }
            Command::Other(raw) => warn!("Unexpected command {:#010x}", raw),
        }
    }

    fn handle_commands(
        &self,
        reg: &dyn ObjectRegistry,
        handler: Option<&dyn TransactionHandler>,
        rb: &mut ReadBuf,
    ) {
        let mut consumed = 0;
        while let Some(cmd) = next_command(&rb.bytes()[consumed..]) {
            let datalen = abi::payload_len(cmd);
            let start = consumed + 4;
            let payload = &rb.bytes()[start..start + datalen];
            self.handle_command(reg, handler, cmd, payload);
            consumed += 4 + datalen;
        }
        rb.shift_tail(consumed);
    }

    /// The transact-aware dispatch pass: recognises the four
    /// reply-determining commands and routes everything else through the
    /// normal dispatcher. `None` means no terminal status yet.
    fn txstatus(
        &self,
        reg: &dyn ObjectRegistry,
        rb: &mut ReadBuf,
        mut reply: Option<&mut RemoteReply>,
    ) -> Option<i32> {
        let io = self.inner.io;
        let mut txstatus = None;
        let mut consumed = 0;
        while txstatus.is_none() {
            let cmd = match next_command(&rb.bytes()[consumed..]) {
                Some(cmd) => cmd,
                None => break,
            };
            let datalen = abi::payload_len(cmd);
            let start = consumed + 4;
            match io.command(cmd) {
                Command::TransactionComplete => {
                    trace!("> BR_TRANSACTION_COMPLETE");
                    if reply.is_none() {
                        txstatus = Some(status::OK);
                    }
                }
                Command::DeadReply => {
                    trace!("> BR_DEAD_REPLY");
                    txstatus = Some(status::DEAD_OBJECT);
                }
                Command::FailedReply => {
                    trace!("> BR_FAILED_REPLY");
                    txstatus = Some(status::FAILED);
                }
                Command::Reply => {
                    let tx =
                        unsafe { (io.decode_transaction_data)(&rb.bytes()[start..start + datalen]) };
                    trace!("> BR_REPLY {} ({} bytes)", tx.status, tx.size);
                    match (reply.as_deref_mut(), tx.data_ptr != 0 && tx.size > 0) {
                        (Some(reply), true) => reply.set_data(
                            KernelBuffer::new(self.clone(), tx.data_ptr, tx.size),
                            tx.offsets,
                        ),
                        _ => {
                            if let Err(err) = self.free_buffer(tx.data_ptr) {
                                warn!("failed to return reply buffer: {}", err);
                            }
                        }
                    }
                    // The pending sentinel must never leak out as a
                    // transaction status.
                    txstatus = Some(if tx.status == -(Errno::EAGAIN as i32) {
                        -(Errno::EFAULT as i32)
                    } else {
                        tx.status
                    });
                }
                _ => {
                    let payload = &rb.bytes()[start..start + datalen];
                    self.handle_command(reg, None, cmd, payload);
                }
            }
            consumed += 4 + datalen;
        }
        rb.shift_tail(consumed);
        txstatus
    }

    /// Waits for driver-delivered commands and dispatches them. Returns
    /// once every complete packet of the read burst has been handled.
    pub fn read(
        &self,
        reg: &dyn ObjectRegistry,
        handler: &dyn TransactionHandler,
    ) -> Result<(), Errno> {
        let mut rb = ReadBuf::new();
        let mut io = rb.io_buf();
        let result = self.write_read(None, Some(&mut io));
        rb.set_filled(io.consumed);
        result?;
        self.handle_commands(reg, Some(handler), &mut rb);
        while rb.filled() > 0 {
            let mut io = rb.io_buf();
            let result = self.write_read(None, Some(&mut io));
            rb.set_filled(io.consumed);
            result?;
            self.handle_commands(reg, Some(handler), &mut rb);
        }
        Ok(())
    }

    /// Issues a transaction to a remote handle. One-way iff no reply
    /// sink is supplied. Inbound commands that arrive ahead of the
    /// reply are dispatched in-line; `Ok` carries the kernel-reported
    /// status, `Err` a driver-level errno.
    pub fn transact(
        &self,
        reg: &dyn ObjectRegistry,
        handle: u32,
        code: u32,
        req: &LocalRequest,
        mut reply: Option<&mut RemoteReply>,
    ) -> Result<i32, Errno> {
        let io = self.inner.io;
        let mut rb = ReadBuf::new();
        let mut wbuf = [0u8; 4 + abi::MAX_BC_TRANSACTION_SG_SIZE];
        let mut offsets_buf = None;
        let flags = if reply.is_some() {
            0
        } else {
            TransactionFlags::ONE_WAY.bits()
        };
        let buffers_size = req.buffers_size();
        let args = TxArgs {
            target: handle as u64,
            code,
            flags,
            data: req.to_slice(),
            offsets: req.offsets(),
        };
        let len = if buffers_size > 0 {
            trace!(
                "< BC_TRANSACTION_SG {:#010x} {:#010x} {} bytes",
                handle,
                code,
                buffers_size
            );
            LittleEndian::write_u32(&mut wbuf[..4], io.bc.transaction_sg);
            (io.encode_transaction_sg)(&mut wbuf[4..], &args, &mut offsets_buf, buffers_size)
        } else {
            trace!("< BC_TRANSACTION {:#010x} {:#010x}", handle, code);
            LittleEndian::write_u32(&mut wbuf[..4], io.bc.transaction);
            (io.encode_transaction)(&mut wbuf[4..], &args, &mut offsets_buf)
        };
        let mut write = IoBuf {
            ptr: wbuf.as_ptr() as usize,
            size: 4 + len,
            consumed: 0,
        };

        let txstatus = loop {
            let mut rio = rb.io_buf();
            let result = self.write_read(Some(&mut write), Some(&mut rio));
            rb.set_filled(rio.consumed);
            result?;
            if let Some(txstatus) = self.txstatus(reg, &mut rb, reply.as_deref_mut()) {
                break txstatus;
            }
        };

        if txstatus >= 0 {
            debug_assert!(write.consumed == write.size || txstatus > 0);

            // Drain whatever the driver queued behind the reply.
            self.handle_commands(reg, None, &mut rb);
            while rb.filled() > 0 {
                let mut rio = rb.io_buf();
                let result = self.write_read(None, Some(&mut rio));
                rb.set_filled(rio.consumed);
                result?;
                self.handle_commands(reg, None, &mut rb);
            }
        }

        Ok(txstatus)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::{payload_len, ABI_64};

    use std::cell::{Cell, RefCell};
    use std::collections::{HashMap, VecDeque};

    thread_local! {
        static WRITTEN: RefCell<Vec<u8>> = RefCell::new(Vec::new());
        static INCOMING: RefCell<VecDeque<Vec<u8>>> = RefCell::new(VecDeque::new());
    }

    fn shim_write_read(
        _fd: RawFd,
        write: Option<&mut IoBuf>,
        read: Option<&mut IoBuf>,
    ) -> Result<(), Errno> {
        if let Some(w) = write {
            let data = unsafe { std::slice::from_raw_parts(w.ptr as *const u8, w.size) };
            WRITTEN.with(|c| c.borrow_mut().extend_from_slice(&data[w.consumed..]));
            w.consumed = w.size;
        }
        if let Some(r) = read {
            if let Some(chunk) = INCOMING.with(|c| c.borrow_mut().pop_front()) {
                assert!(r.consumed + chunk.len() <= r.size);
                let dst = unsafe {
                    std::slice::from_raw_parts_mut((r.ptr + r.consumed) as *mut u8, chunk.len())
                };
                dst.copy_from_slice(&chunk);
                r.consumed += chunk.len();
            }
        }
        Ok(())
    }

    fn shim_driver() -> Driver {
        WRITTEN.with(|c| c.borrow_mut().clear());
        INCOMING.with(|c| c.borrow_mut().clear());
        let io: &'static BinderAbi = Box::leak(Box::new(BinderAbi {
            write_read: shim_write_read,
            ..ABI_64
        }));
        Driver {
            inner: Arc::new(Inner {
                dev: "/dev/binder".to_string(),
                fd: -1,
                vm: ptr::null_mut(),
                vmsize: 0,
                io,
                protocol: protocol_for_device("/dev/binder"),
            }),
        }
    }

    fn packet(cmd: u32, payload: &[u8]) -> Vec<u8> {
        assert_eq!(payload_len(cmd), payload.len());
        let mut out = vec![0u8; 4];
        LittleEndian::write_u32(&mut out, cmd);
        out.extend_from_slice(payload);
        out
    }

    fn ptr_cookie(ptr: u64, cookie: u64) -> Vec<u8> {
        let mut out = vec![0u8; 16];
        LittleEndian::write_u64(&mut out[..8], ptr);
        LittleEndian::write_u64(&mut out[8..], cookie);
        out
    }

    fn cookie(value: u64) -> Vec<u8> {
        let mut out = vec![0u8; 8];
        LittleEndian::write_u64(&mut out, value);
        out
    }

    fn envelope(io: &BinderAbi, target: u64, code: u32, flags: u32, data: &'static [u8]) -> Vec<u8> {
        let args = TxArgs {
            target,
            code,
            flags,
            data,
            offsets: &[],
        };
        let mut out = vec![0u8; abi::MAX_BC_TRANSACTION_SIZE];
        let mut offsets_buf = None;
        let len = (io.encode_transaction)(&mut out, &args, &mut offsets_buf);
        assert!(offsets_buf.is_none());
        out.truncate(len);
        out
    }

    fn written_packets() -> Vec<(u32, Vec<u8>)> {
        WRITTEN.with(|c| {
            let data = c.borrow();
            let mut out = vec![];
            let mut at = 0;
            while at + 4 <= data.len() {
                let cmd = LittleEndian::read_u32(&data[at..]);
                let len = payload_len(cmd);
                out.push((cmd, data[at + 4..at + 4 + len].to_vec()));
                at += 4 + len;
            }
            assert_eq!(at, data.len());
            out
        })
    }

    fn feed(chunk: Vec<u8>) {
        INCOMING.with(|c| c.borrow_mut().push_back(chunk));
    }

    struct TestLocal {
        support: TransactionSupport,
        increfs: Cell<usize>,
        acquire: Cell<usize>,
        decrefs: Cell<usize>,
        release: Cell<usize>,
        looper_calls: Cell<usize>,
        seen_iface: RefCell<Option<String>>,
    }

    impl TestLocal {
        fn new(support: TransactionSupport) -> Self {
            Self {
                support,
                increfs: Cell::new(0),
                acquire: Cell::new(0),
                decrefs: Cell::new(0),
                release: Cell::new(0),
                looper_calls: Cell::new(0),
                seen_iface: RefCell::new(None),
            }
        }
    }

    impl LocalObject for TestLocal {
        fn can_handle_transaction(&self, iface: Option<&str>, _code: u32) -> TransactionSupport {
            *self.seen_iface.borrow_mut() = iface.map(str::to_string);
            self.support
        }

        fn handle_looper_transaction(
            &self,
            _req: &mut RemoteRequest,
            _code: u32,
            _flags: u32,
        ) -> (Option<LocalReply>, i32) {
            self.looper_calls.set(self.looper_calls.get() + 1);
            let mut reply = LocalReply::new();
            reply.write_u32(0xabcd).unwrap();
            (Some(reply), status::OK)
        }

        fn handle_increfs(&self) {
            self.increfs.set(self.increfs.get() + 1);
        }

        fn handle_acquire(&self) {
            self.acquire.set(self.acquire.get() + 1);
        }

        fn handle_decrefs(&self) {
            self.decrefs.set(self.decrefs.get() + 1);
        }

        fn handle_release(&self) {
            self.release.set(self.release.get() + 1);
        }
    }

    struct TestRemote {
        handle: u32,
        deaths: Cell<usize>,
    }

    impl RemoteObject for TestRemote {
        fn handle(&self) -> u32 {
            self.handle
        }

        fn handle_death_notification(&self) {
            self.deaths.set(self.deaths.get() + 1);
        }
    }

    #[derive(Default)]
    struct TestRegistry {
        locals: RefCell<HashMap<u64, Arc<TestLocal>>>,
        remotes: RefCell<HashMap<u32, Arc<TestRemote>>>,
    }

    impl TestRegistry {
        fn add_local(&self, ptr: u64, support: TransactionSupport) -> Arc<TestLocal> {
            let obj = Arc::new(TestLocal::new(support));
            self.locals.borrow_mut().insert(ptr, obj.clone());
            obj
        }

        fn add_remote(&self, handle: u32) -> Arc<TestRemote> {
            let obj = Arc::new(TestRemote {
                handle,
                deaths: Cell::new(0),
            });
            self.remotes.borrow_mut().insert(handle, obj.clone());
            obj
        }
    }

    impl ObjectRegistry for TestRegistry {
        fn get_local(&self, ptr: u64) -> Option<Arc<dyn LocalObject>> {
            match self.locals.borrow().get(&ptr) {
                Some(obj) => {
                    let obj: Arc<dyn LocalObject> = obj.clone();
                    Some(obj)
                }
                None => None,
            }
        }

        fn get_remote(&self, handle: u32) -> Option<Arc<dyn RemoteObject>> {
            match self.remotes.borrow().get(&handle) {
                Some(obj) => {
                    let obj: Arc<dyn RemoteObject> = obj.clone();
                    Some(obj)
                }
                None => None,
            }
        }
    }

    struct PanicHandler;

    impl TransactionHandler for PanicHandler {
        fn transact(
            &self,
            _obj: &dyn LocalObject,
            _req: &mut RemoteRequest,
            _code: u32,
            _flags: u32,
        ) -> (Option<LocalReply>, i32) {
            panic!("handler must not be invoked");
        }
    }

    struct EchoHandler {
        calls: Cell<usize>,
    }

    impl TransactionHandler for EchoHandler {
        fn transact(
            &self,
            _obj: &dyn LocalObject,
            req: &mut RemoteRequest,
            _code: u32,
            _flags: u32,
        ) -> (Option<LocalReply>, i32) {
            self.calls.set(self.calls.get() + 1);
            let mut reply = LocalReply::new();
            reply.write(req.data()).unwrap();
            (Some(reply), status::OK)
        }
    }

    fn aidl_request_bytes(iface: &str, payload: &[u8]) -> &'static [u8] {
        let mut parcel = crate::parcel::Parcel::empty();
        protocol_for_device("/dev/binder")
            .write_rpc_header(&mut parcel, iface)
            .unwrap();
        parcel.write(payload).unwrap();
        Box::leak(parcel.to_slice().to_vec().into_boxed_slice())
    }

    #[test]
    fn clones_share_one_session() {
        let driver = shim_driver();
        let second = driver.clone();
        let third = second.clone();
        assert_eq!(Arc::strong_count(&driver.inner), 3);
        drop(second);
        drop(third);
        assert_eq!(Arc::strong_count(&driver.inner), 1);
    }

    #[test]
    fn free_buffer_null_is_a_no_op() {
        let driver = shim_driver();
        driver.free_buffer(0).unwrap();
        assert!(written_packets().is_empty());
    }

    #[test]
    fn kernel_buffer_returns_its_chunk_once() {
        let driver = shim_driver();
        let data: &'static [u8] = Box::leak(vec![1u8, 2, 3, 4].into_boxed_slice());
        let buf = KernelBuffer::new(driver.clone(), data.as_ptr() as usize, data.len());
        drop(driver);
        assert!(written_packets().is_empty());
        drop(buf);
        let packets = written_packets();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].0, ABI_64.bc.free_buffer);
        assert_eq!(
            LittleEndian::read_u64(&packets[0].1),
            data.as_ptr() as u64
        );
    }

    #[test]
    fn looper_and_refcount_submitters_encode_handles() {
        let driver = shim_driver();
        driver.enter_looper().unwrap();
        driver.increfs(0x31).unwrap();
        driver.acquire(0x31).unwrap();
        driver.release(0x31).unwrap();
        driver.decrefs(0x31).unwrap();
        driver.exit_looper().unwrap();
        let io = driver.io();
        let packets = written_packets();
        let cmds: Vec<u32> = packets.iter().map(|p| p.0).collect();
        assert_eq!(
            cmds,
            vec![
                io.bc.enter_looper,
                io.bc.increfs,
                io.bc.acquire,
                io.bc.release,
                io.bc.decrefs,
                io.bc.exit_looper
            ]
        );
        assert_eq!(LittleEndian::read_u32(&packets[1].1), 0x31);
    }

    #[test]
    fn one_way_transact_completes_without_reply() {
        let driver = shim_driver();
        let reg = TestRegistry::default();
        feed(packet(driver.io().br.transaction_complete, &[]));

        let mut req = LocalRequest::new();
        req.write(&[7u8; 16]).unwrap();
        let status = driver.transact(&reg, 0x1, 0x10, &req, None).unwrap();
        assert_eq!(status, status::OK);

        let packets = written_packets();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].0, driver.io().bc.transaction);
        let tx = unsafe { (driver.io().decode_transaction_data)(&packets[0].1) };
        assert_eq!(tx.target, 0x1);
        assert_eq!(tx.code, 0x10);
        assert_ne!(tx.flags & TransactionFlags::ONE_WAY.bits(), 0);
        assert_eq!(tx.size, 16);
    }

    #[test]
    fn two_way_transact_acks_interleaved_increfs_before_returning() {
        let driver = shim_driver();
        let io = driver.io();
        let reg = TestRegistry::default();
        let local = reg.add_local(0xAA, TransactionSupport::Unhandled);

        let reply_data: &'static [u8] = Box::leak(vec![0xDE, 0xAD, 0xBE, 0xEF].into_boxed_slice());
        let pc = ptr_cookie(0xAA, 0xBB);
        let mut chunk = packet(io.br.increfs, &pc);
        chunk.extend(packet(io.br.transaction_complete, &[]));
        chunk.extend(packet(io.br.reply, &envelope(io, 0, 0, 0, reply_data)));
        feed(chunk);

        let req = LocalRequest::new();
        let mut reply = RemoteReply::new();
        let status = driver
            .transact(&reg, 0x2, 0x20, &req, Some(&mut reply))
            .unwrap();

        assert_eq!(status, 0);
        assert_eq!(reply.data(), [0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(local.increfs.get(), 1);

        let packets = written_packets();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].0, io.bc.transaction);
        assert_eq!(packets[1].0, io.bc.increfs_done);
        assert_eq!(packets[1].1, pc);

        drop(reply);
        let packets = written_packets();
        assert_eq!(packets.len(), 3);
        assert_eq!(packets[2].0, io.bc.free_buffer);
        assert_eq!(
            LittleEndian::read_u64(&packets[2].1),
            reply_data.as_ptr() as u64
        );
    }

    #[test]
    fn dead_reply_leaves_the_reply_empty() {
        let driver = shim_driver();
        let reg = TestRegistry::default();
        feed(packet(driver.io().br.dead_reply, &[]));

        let req = LocalRequest::new();
        let mut reply = RemoteReply::new();
        let status = driver
            .transact(&reg, 0x3, 0x30, &req, Some(&mut reply))
            .unwrap();
        assert_eq!(status, status::DEAD_OBJECT);
        assert!(reply.is_empty());
    }

    #[test]
    fn failed_reply_maps_to_failed() {
        let driver = shim_driver();
        let reg = TestRegistry::default();
        feed(packet(driver.io().br.failed_reply, &[]));

        let req = LocalRequest::new();
        let mut reply = RemoteReply::new();
        let status = driver
            .transact(&reg, 0x3, 0x30, &req, Some(&mut reply))
            .unwrap();
        assert_eq!(status, status::FAILED);
    }

    #[test]
    fn reply_status_eagain_is_remapped() {
        let driver = shim_driver();
        let io = driver.io();
        let reg = TestRegistry::default();

        let status_word: &'static [u8] = Box::leak(
            (-(Errno::EAGAIN as i32)).to_le_bytes().to_vec().into_boxed_slice(),
        );
        let env = envelope(
            io,
            0,
            0,
            TransactionFlags::STATUS_CODE.bits(),
            status_word,
        );
        feed(packet(io.br.reply, &env));

        let req = LocalRequest::new();
        let mut reply = RemoteReply::new();
        let status = driver
            .transact(&reg, 0x4, 0x40, &req, Some(&mut reply))
            .unwrap();
        assert_eq!(status, -(Errno::EFAULT as i32));
    }

    #[test]
    fn scatter_gather_is_used_iff_extra_buffers_declared() {
        let driver = shim_driver();
        let reg = TestRegistry::default();
        feed(packet(driver.io().br.transaction_complete, &[]));
        let mut req = LocalRequest::new();
        req.write(&[1u8; 8]).unwrap();
        req.add_buffer(100);
        driver.transact(&reg, 0x1, 0x11, &req, None).unwrap();
        let packets = written_packets();
        assert_eq!(packets[0].0, driver.io().bc.transaction_sg);

        WRITTEN.with(|c| c.borrow_mut().clear());
        feed(packet(driver.io().br.transaction_complete, &[]));
        let mut req = LocalRequest::new();
        req.write(&[1u8; 8]).unwrap();
        driver.transact(&reg, 0x1, 0x11, &req, None).unwrap();
        let packets = written_packets();
        assert_eq!(packets[0].0, driver.io().bc.transaction);
    }

    #[test]
    fn unhandled_inbound_transaction_yields_bad_message_status() {
        let driver = shim_driver();
        let io = driver.io();
        let reg = TestRegistry::default();
        reg.add_local(0x10, TransactionSupport::Unhandled);

        let data = aidl_request_bytes("com.example.IUnknown", &[5, 6, 7, 8]);
        feed(packet(io.br.transaction, &envelope(io, 0x10, 0x99, 0, data)));

        driver.read(&reg, &PanicHandler).unwrap();

        let packets = written_packets();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].0, io.bc.reply);
        let status_reply = unsafe { (io.decode_transaction_data)(&packets[0].1) };
        assert_eq!(status_reply.status, -(Errno::EBADMSG as i32));
        assert_ne!(
            status_reply.flags & TransactionFlags::STATUS_CODE.bits(),
            0
        );
        assert_eq!(packets[1].0, io.bc.free_buffer);
        assert_eq!(LittleEndian::read_u64(&packets[1].1), data.as_ptr() as u64);
    }

    #[test]
    fn supported_inbound_transaction_reaches_the_handler() {
        let driver = shim_driver();
        let io = driver.io();
        let reg = TestRegistry::default();
        let local = reg.add_local(0x20, TransactionSupport::Supported);

        let data = aidl_request_bytes("com.example.IEcho", &[9, 9, 9, 9]);
        feed(packet(io.br.transaction, &envelope(io, 0x20, 0x1, 0, data)));

        let handler = EchoHandler {
            calls: Cell::new(0),
        };
        driver.read(&reg, &handler).unwrap();

        assert_eq!(handler.calls.get(), 1);
        assert_eq!(
            local.seen_iface.borrow().as_deref(),
            Some("com.example.IEcho")
        );
        let packets = written_packets();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].0, io.bc.reply);
        let reply_tx = unsafe { (io.decode_transaction_data)(&packets[0].1) };
        assert_eq!(reply_tx.size, 4);
        assert_eq!(packets[1].0, io.bc.free_buffer);
    }

    #[test]
    fn looper_inbound_transaction_is_answered_inline() {
        let driver = shim_driver();
        let io = driver.io();
        let reg = TestRegistry::default();
        let local = reg.add_local(0x30, TransactionSupport::Looper);

        let data = aidl_request_bytes("com.example.ILooper", &[]);
        feed(packet(io.br.transaction, &envelope(io, 0x30, 0x2, 0, data)));

        driver.read(&reg, &PanicHandler).unwrap();

        assert_eq!(local.looper_calls.get(), 1);
        let packets = written_packets();
        assert_eq!(packets[0].0, io.bc.reply);
    }

    #[test]
    fn one_way_inbound_transaction_gets_no_reply() {
        let driver = shim_driver();
        let io = driver.io();
        let reg = TestRegistry::default();
        reg.add_local(0x40, TransactionSupport::Looper);

        let data = aidl_request_bytes("com.example.IOneWay", &[1]);
        let flags = TransactionFlags::ONE_WAY.bits();
        feed(packet(io.br.transaction, &envelope(io, 0x40, 0x3, flags, data)));

        driver.read(&reg, &PanicHandler).unwrap();

        let packets = written_packets();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].0, io.bc.free_buffer);
    }

    #[test]
    fn refcount_commands_are_acknowledged_with_the_same_payload() {
        let driver = shim_driver();
        let io = driver.io();
        let reg = TestRegistry::default();
        let local = reg.add_local(0x50, TransactionSupport::Unhandled);

        let pc = ptr_cookie(0x50, 0x51);
        let mut chunk = packet(io.br.increfs, &pc);
        chunk.extend(packet(io.br.acquire, &pc));
        chunk.extend(packet(io.br.decrefs, &pc));
        chunk.extend(packet(io.br.release, &pc));
        feed(chunk);

        driver.read(&reg, &PanicHandler).unwrap();

        assert_eq!(local.increfs.get(), 1);
        assert_eq!(local.acquire.get(), 1);
        assert_eq!(local.decrefs.get(), 1);
        assert_eq!(local.release.get(), 1);

        let packets = written_packets();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].0, io.bc.increfs_done);
        assert_eq!(packets[0].1, pc);
        assert_eq!(packets[1].0, io.bc.acquire_done);
        assert_eq!(packets[1].1, pc);
    }

    #[test]
    fn death_notification_round_trip() {
        let driver = shim_driver();
        let io = driver.io();
        let reg = TestRegistry::default();
        let remote = reg.add_remote(0x42);

        driver.request_death_notification(remote.as_ref()).unwrap();
        let packets = written_packets();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].0, io.bc.request_death_notification);
        assert_eq!(LittleEndian::read_u32(&packets[0].1[..4]), 0x42);

        feed(packet(io.br.dead_binder, &cookie(0x42)));
        driver.read(&reg, &PanicHandler).unwrap();
        assert_eq!(remote.deaths.get(), 1);

        driver.clear_death_notification(remote.as_ref()).unwrap();
        feed(packet(io.br.clear_death_notification_done, &[]));
        driver.read(&reg, &PanicHandler).unwrap();
        assert_eq!(remote.deaths.get(), 1);
        let packets = written_packets();
        assert_eq!(packets[1].0, io.bc.clear_death_notification);
    }

    #[test]
    fn noop_class_commands_have_no_side_effects() {
        let driver = shim_driver();
        let io = driver.io();
        let reg = TestRegistry::default();
        let mut chunk = packet(io.br.noop, &[]);
        chunk.extend(packet(io.br.ok, &[]));
        chunk.extend(packet(io.br.spawn_looper, &[]));
        chunk.extend(packet(io.br.finished, &[]));
        feed(chunk);
        driver.read(&reg, &PanicHandler).unwrap();
        assert!(written_packets().is_empty());
    }

    #[test]
    fn unknown_inbound_opcode_is_dropped() {
        let driver = shim_driver();
        let reg = TestRegistry::default();
        feed(packet(0x7f63_0004, &[0, 0, 0, 0]));
        driver.read(&reg, &PanicHandler).unwrap();
        assert!(written_packets().is_empty());
    }

    #[test]
    fn local_request_is_prefixed_with_the_dialect_header() {
        let driver = shim_driver();
        let req = driver.local_request_new("com.example.IFoo").unwrap();
        let (iface, _) = driver
            .protocol()
            .extract_interface(req.to_slice())
            .unwrap();
        assert_eq!(iface, "com.example.IFoo");
    }
}
