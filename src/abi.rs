use crate::buffer::IoBuf;

use byteorder::{ByteOrder, LittleEndian};
use nix::{errno::Errno, ioctl_readwrite, ioctl_write_ptr};

use std::os::unix::io::RawFd;

/// Kernel version sentinel reported by the 32-bit driver ABI.
pub const BINDER_VERSION_32: i32 = 8;
/// Kernel version sentinel reported by the 64-bit driver ABI.
pub const BINDER_VERSION_64: i32 = 9;

ioctl_readwrite!(binder_version, b'b', 9, i32);
ioctl_write_ptr!(binder_set_max_threads, b'b', 5, u32);

bitflags! {
    pub struct TransactionFlags: u32 {
        const ONE_WAY = 0x01;
        const ROOT_OBJECT = 0x04;
        const STATUS_CODE = 0x08;
        const ACCEPT_FDS = 0x10;
    }
}

/// Extracts the payload length encoded in the low 16 bits of a command code.
pub const fn payload_len(cmd: u32) -> usize {
    (cmd & 0xffff) as usize
}

const fn bc_op(nr: u8, len: usize) -> u32 {
    ((b'c' as u32) << 24) | ((nr as u32) << 16) | (len as u32)
}

const fn br_op(nr: u8, len: usize) -> u32 {
    ((b'r' as u32) << 24) | ((nr as u32) << 16) | (len as u32)
}

/* Struct sizes per pointer width. The transaction envelope is
 * {target, cookie, code, flags, pid, euid, data_size, offsets_size,
 * data_ptr, offsets_ptr} with pointer-sized fields where the driver
 * stores pointers or sizes; the SG variant appends buffers_size. */
const TX_SIZE_32: usize = 40;
const TX_SIZE_64: usize = 64;
const TX_SG_SIZE_32: usize = TX_SIZE_32 + 4;
const TX_SG_SIZE_64: usize = TX_SIZE_64 + 8;
const PTR_COOKIE_SIZE_32: usize = 8;
const PTR_COOKIE_SIZE_64: usize = 16;
const DEATH_SIZE_32: usize = 8;
const DEATH_SIZE_64: usize = 12;

pub const MAX_POINTER_SIZE: usize = 8;
pub const MAX_PTR_COOKIE_SIZE: usize = PTR_COOKIE_SIZE_64;
pub const MAX_DEATH_NOTIFICATION_SIZE: usize = DEATH_SIZE_64;
pub const MAX_BC_TRANSACTION_SIZE: usize = TX_SIZE_64;
pub const MAX_BC_TRANSACTION_SG_SIZE: usize = TX_SG_SIZE_64;

/// Size of the scratch buffer handed to the driver on every read. Large
/// enough for the biggest batch of packets the driver produces per
/// syscall with either ABI.
pub const READ_BUFFER_SIZE: usize = 512;

#[derive(Debug, Clone, Copy)]
pub struct BcOpcodes {
    pub transaction: u32,
    pub reply: u32,
    pub transaction_sg: u32,
    pub reply_sg: u32,
    pub free_buffer: u32,
    pub increfs: u32,
    pub decrefs: u32,
    pub acquire: u32,
    pub release: u32,
    pub increfs_done: u32,
    pub acquire_done: u32,
    pub request_death_notification: u32,
    pub clear_death_notification: u32,
    pub enter_looper: u32,
    pub exit_looper: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct BrOpcodes {
    pub noop: u32,
    pub ok: u32,
    pub transaction: u32,
    pub reply: u32,
    pub transaction_complete: u32,
    pub spawn_looper: u32,
    pub finished: u32,
    pub increfs: u32,
    pub decrefs: u32,
    pub acquire: u32,
    pub release: u32,
    pub dead_binder: u32,
    pub dead_reply: u32,
    pub failed_reply: u32,
    pub clear_death_notification_done: u32,
}

/// An inbound command normalised out of its ABI-specific numeric code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Noop,
    Ok,
    Transaction,
    Reply,
    TransactionComplete,
    SpawnLooper,
    Finished,
    Increfs,
    Decrefs,
    Acquire,
    Release,
    DeadBinder,
    DeadReply,
    FailedReply,
    ClearDeathNotificationDone,
    Other(u32),
}

/// Outbound transaction parameters handed to the envelope encoders.
pub struct TxArgs<'a> {
    pub target: u64,
    pub code: u32,
    pub flags: u32,
    pub data: &'a [u8],
    pub offsets: &'a [usize],
}

/// A decoded transaction envelope. `data_ptr` points into the receive
/// mapping and stays owned by the driver until returned with a
/// free-buffer command.
#[derive(Debug)]
pub struct TxData {
    pub target: u64,
    pub cookie: u64,
    pub code: u32,
    pub flags: u32,
    pub pid: i32,
    pub euid: u32,
    pub data_ptr: usize,
    pub size: usize,
    pub offsets: Vec<usize>,
    pub status: i32,
}

impl TxData {
    pub fn is_one_way(&self) -> bool {
        self.flags & TransactionFlags::ONE_WAY.bits() != 0
    }
}

/// The operation table for one kernel ABI: opcode constants plus the
/// codecs for its struct layouts. Selected once at open time by equality
/// with the kernel-reported version; process-static thereafter.
#[derive(Clone, Copy)]
pub struct BinderAbi {
    pub version: i32,
    pub pointer_size: usize,
    pub bc: BcOpcodes,
    pub br: BrOpcodes,
    pub encode_pointer: fn(&mut [u8], usize) -> usize,
    pub encode_transaction: fn(&mut [u8], &TxArgs<'_>, &mut Option<Vec<u8>>) -> usize,
    pub encode_transaction_sg: fn(&mut [u8], &TxArgs<'_>, &mut Option<Vec<u8>>, usize) -> usize,
    pub encode_status_reply: fn(&mut [u8], &i32) -> usize,
    pub encode_death_notification: fn(&mut [u8], u32) -> usize,
    pub decode_transaction_data: unsafe fn(&[u8]) -> TxData,
    pub decode_binder_ptr_cookie: fn(&[u8]) -> u64,
    pub decode_cookie: fn(&[u8]) -> u64,
    pub write_read: fn(RawFd, Option<&mut IoBuf>, Option<&mut IoBuf>) -> Result<(), Errno>,
}

impl BinderAbi {
    /// Normalises an inbound command code against this ABI's table.
    pub fn command(&self, raw: u32) -> Command {
        let br = &self.br;
        if raw == br.noop {
            Command::Noop
        } else if raw == br.ok {
            Command::Ok
        } else if raw == br.transaction {
            Command::Transaction
        } else if raw == br.reply {
            Command::Reply
        } else if raw == br.transaction_complete {
            Command::TransactionComplete
        } else if raw == br.spawn_looper {
            Command::SpawnLooper
        } else if raw == br.finished {
            Command::Finished
        } else if raw == br.increfs {
            Command::Increfs
        } else if raw == br.decrefs {
            Command::Decrefs
        } else if raw == br.acquire {
            Command::Acquire
        } else if raw == br.release {
            Command::Release
        } else if raw == br.dead_binder {
            Command::DeadBinder
        } else if raw == br.dead_reply {
            Command::DeadReply
        } else if raw == br.failed_reply {
            Command::FailedReply
        } else if raw == br.clear_death_notification_done {
            Command::ClearDeathNotificationDone
        } else {
            Command::Other(raw)
        }
    }
}

/// Picks the adapter whose recorded version matches the kernel's.
pub fn abi_for_version(version: i32) -> Option<&'static BinderAbi> {
    if version == ABI_32.version {
        Some(&ABI_32)
    } else if version == ABI_64.version {
        Some(&ABI_64)
    } else {
        None
    }
}

fn put_u32(out: &mut [u8], at: &mut usize, v: u32) {
    LittleEndian::write_u32(&mut out[*at..], v);
    *at += 4;
}

fn put_i32(out: &mut [u8], at: &mut usize, v: i32) {
    LittleEndian::write_i32(&mut out[*at..], v);
    *at += 4;
}

fn put_uptr(out: &mut [u8], at: &mut usize, psize: usize, v: u64) {
    if psize == 4 {
        LittleEndian::write_u32(&mut out[*at..], v as u32);
    } else {
        LittleEndian::write_u64(&mut out[*at..], v);
    }
    *at += psize;
}

fn get_u32(data: &[u8], at: &mut usize) -> u32 {
    let v = LittleEndian::read_u32(&data[*at..]);
    *at += 4;
    v
}

fn get_i32(data: &[u8], at: &mut usize) -> i32 {
    let v = LittleEndian::read_i32(&data[*at..]);
    *at += 4;
    v
}

fn get_uptr(data: &[u8], at: &mut usize, psize: usize) -> u64 {
    let v = if psize == 4 {
        LittleEndian::read_u32(&data[*at..]) as u64
    } else {
        LittleEndian::read_u64(&data[*at..])
    };
    *at += psize;
    v
}

fn encode_pointer_with(psize: usize, out: &mut [u8], ptr: usize) -> usize {
    let mut at = 0;
    put_uptr(out, &mut at, psize, ptr as u64);
    at
}

fn encode_offsets(psize: usize, offsets: &[usize]) -> Vec<u8> {
    let mut buf = vec![0u8; offsets.len() * psize];
    let mut at = 0;
    for off in offsets {
        put_uptr(&mut buf, &mut at, psize, *off as u64);
    }
    buf
}

fn encode_transaction_with(
    psize: usize,
    out: &mut [u8],
    args: &TxArgs<'_>,
    offsets_buf: &mut Option<Vec<u8>>,
) -> usize {
    let mut at = 0;
    put_uptr(out, &mut at, psize, args.target);
    put_uptr(out, &mut at, psize, 0); // cookie
    put_u32(out, &mut at, args.code);
    put_u32(out, &mut at, args.flags);
    put_i32(out, &mut at, 0); // sender pid, filled in by the driver
    put_u32(out, &mut at, 0); // sender euid, ditto
    put_uptr(out, &mut at, psize, args.data.len() as u64);
    put_uptr(out, &mut at, psize, (args.offsets.len() * psize) as u64);
    let data_ptr = if args.data.is_empty() {
        0
    } else {
        args.data.as_ptr() as u64
    };
    put_uptr(out, &mut at, psize, data_ptr);
    if args.offsets.is_empty() {
        put_uptr(out, &mut at, psize, 0);
    } else {
        let encoded = encode_offsets(psize, args.offsets);
        put_uptr(out, &mut at, psize, encoded.as_ptr() as u64);
        *offsets_buf = Some(encoded);
    }
    at
}

fn encode_transaction_sg_with(
    psize: usize,
    out: &mut [u8],
    args: &TxArgs<'_>,
    offsets_buf: &mut Option<Vec<u8>>,
    buffers_size: usize,
) -> usize {
    let mut at = encode_transaction_with(psize, out, args, offsets_buf);
    put_uptr(out, &mut at, psize, buffers_size as u64);
    at
}

fn encode_status_reply_with(psize: usize, out: &mut [u8], status: &i32) -> usize {
    let mut at = 0;
    put_uptr(out, &mut at, psize, 0); // target
    put_uptr(out, &mut at, psize, 0); // cookie
    put_u32(out, &mut at, 0); // code
    put_u32(out, &mut at, TransactionFlags::STATUS_CODE.bits());
    put_i32(out, &mut at, 0);
    put_u32(out, &mut at, 0);
    put_uptr(out, &mut at, psize, 4); // data size: just the status word
    put_uptr(out, &mut at, psize, 0); // no offsets
    put_uptr(out, &mut at, psize, status as *const i32 as u64);
    put_uptr(out, &mut at, psize, 0);
    at
}

fn encode_death_notification_with(psize: usize, out: &mut [u8], handle: u32) -> usize {
    let mut at = 0;
    put_u32(out, &mut at, handle);
    // The handle doubles as the cookie delivered back with dead_binder.
    put_uptr(out, &mut at, psize, handle as u64);
    at
}

/// Decodes a transaction envelope. The offset table and, for status
/// replies, the status word are read through the kernel-provided
/// pointers, which must designate live memory.
unsafe fn decode_transaction_data_with(psize: usize, data: &[u8]) -> TxData {
    let mut at = 0;
    let target = get_uptr(data, &mut at, psize);
    let cookie = get_uptr(data, &mut at, psize);
    let code = get_u32(data, &mut at);
    let flags = get_u32(data, &mut at);
    let pid = get_i32(data, &mut at);
    let euid = get_u32(data, &mut at);
    let size = get_uptr(data, &mut at, psize) as usize;
    let offsets_size = get_uptr(data, &mut at, psize) as usize;
    let data_ptr = get_uptr(data, &mut at, psize) as usize;
    let offsets_ptr = get_uptr(data, &mut at, psize) as usize;

    let mut offsets = Vec::new();
    if offsets_ptr != 0 && offsets_size >= psize {
        let raw = std::slice::from_raw_parts(offsets_ptr as *const u8, offsets_size);
        let mut off_at = 0;
        while off_at + psize <= offsets_size {
            offsets.push(get_uptr(raw, &mut off_at, psize) as usize);
        }
    }

    let status = if flags & TransactionFlags::STATUS_CODE.bits() != 0 && data_ptr != 0 && size >= 4
    {
        let raw = std::slice::from_raw_parts(data_ptr as *const u8, 4);
        LittleEndian::read_i32(raw)
    } else {
        0
    };

    TxData {
        target,
        cookie,
        code,
        flags,
        pid,
        euid,
        data_ptr,
        size,
        offsets,
        status,
    }
}

fn decode_binder_ptr_cookie_with(psize: usize, data: &[u8]) -> u64 {
    let mut at = 0;
    get_uptr(data, &mut at, psize)
}

fn decode_cookie_with(psize: usize, data: &[u8]) -> u64 {
    let mut at = 0;
    get_uptr(data, &mut at, psize)
}

#[repr(C)]
struct WriteRead32 {
    write_size: u32,
    write_consumed: u32,
    write_buffer: u32,
    read_size: u32,
    read_consumed: u32,
    read_buffer: u32,
}

#[repr(C)]
struct WriteRead64 {
    write_size: u64,
    write_consumed: u64,
    write_buffer: u64,
    read_size: u64,
    read_consumed: u64,
    read_buffer: u64,
}

ioctl_readwrite!(binder_write_read_32, b'b', 1, WriteRead32);
ioctl_readwrite!(binder_write_read_64, b'b', 1, WriteRead64);

fn write_read_32(
    fd: RawFd,
    mut write: Option<&mut IoBuf>,
    mut read: Option<&mut IoBuf>,
) -> Result<(), Errno> {
    let mut wr = WriteRead32 {
        write_size: write.as_ref().map_or(0, |b| b.size as u32),
        write_consumed: write.as_ref().map_or(0, |b| b.consumed as u32),
        write_buffer: write.as_ref().map_or(0, |b| b.ptr as u32),
        read_size: read.as_ref().map_or(0, |b| b.size as u32),
        read_consumed: read.as_ref().map_or(0, |b| b.consumed as u32),
        read_buffer: read.as_ref().map_or(0, |b| b.ptr as u32),
    };
    unsafe { binder_write_read_32(fd, &mut wr) }?;
    if let Some(b) = write.as_deref_mut() {
        b.consumed = wr.write_consumed as usize;
    }
    if let Some(b) = read.as_deref_mut() {
        b.consumed = wr.read_consumed as usize;
    }
    Ok(())
}

fn write_read_64(
    fd: RawFd,
    mut write: Option<&mut IoBuf>,
    mut read: Option<&mut IoBuf>,
) -> Result<(), Errno> {
    let mut wr = WriteRead64 {
        write_size: write.as_ref().map_or(0, |b| b.size as u64),
        write_consumed: write.as_ref().map_or(0, |b| b.consumed as u64),
        write_buffer: write.as_ref().map_or(0, |b| b.ptr as u64),
        read_size: read.as_ref().map_or(0, |b| b.size as u64),
        read_consumed: read.as_ref().map_or(0, |b| b.consumed as u64),
        read_buffer: read.as_ref().map_or(0, |b| b.ptr as u64),
    };
    unsafe { binder_write_read_64(fd, &mut wr) }?;
    if let Some(b) = write.as_deref_mut() {
        b.consumed = wr.write_consumed as usize;
    }
    if let Some(b) = read.as_deref_mut() {
        b.consumed = wr.read_consumed as usize;
    }
    Ok(())
}

fn encode_pointer_32(out: &mut [u8], ptr: usize) -> usize {
    encode_pointer_with(4, out, ptr)
}
fn encode_transaction_32(out: &mut [u8], args: &TxArgs<'_>, ob: &mut Option<Vec<u8>>) -> usize {
    encode_transaction_with(4, out, args, ob)
}
fn encode_transaction_sg_32(
    out: &mut [u8],
    args: &TxArgs<'_>,
    ob: &mut Option<Vec<u8>>,
    buffers_size: usize,
) -> usize {
    encode_transaction_sg_with(4, out, args, ob, buffers_size)
}
fn encode_status_reply_32(out: &mut [u8], status: &i32) -> usize {
    encode_status_reply_with(4, out, status)
}
fn encode_death_notification_32(out: &mut [u8], handle: u32) -> usize {
    encode_death_notification_with(4, out, handle)
}
unsafe fn decode_transaction_data_32(data: &[u8]) -> TxData {
    decode_transaction_data_with(4, data)
}
fn decode_binder_ptr_cookie_32(data: &[u8]) -> u64 {
    decode_binder_ptr_cookie_with(4, data)
}
fn decode_cookie_32(data: &[u8]) -> u64 {
    decode_cookie_with(4, data)
}

fn encode_pointer_64(out: &mut [u8], ptr: usize) -> usize {
    encode_pointer_with(8, out, ptr)
}
fn encode_transaction_64(out: &mut [u8], args: &TxArgs<'_>, ob: &mut Option<Vec<u8>>) -> usize {
    encode_transaction_with(8, out, args, ob)
}
fn encode_transaction_sg_64(
    out: &mut [u8],
    args: &TxArgs<'_>,
    ob: &mut Option<Vec<u8>>,
    buffers_size: usize,
) -> usize {
    encode_transaction_sg_with(8, out, args, ob, buffers_size)
}
fn encode_status_reply_64(out: &mut [u8], status: &i32) -> usize {
    encode_status_reply_with(8, out, status)
}
fn encode_death_notification_64(out: &mut [u8], handle: u32) -> usize {
    encode_death_notification_with(8, out, handle)
}
unsafe fn decode_transaction_data_64(data: &[u8]) -> TxData {
    decode_transaction_data_with(8, data)
}
fn decode_binder_ptr_cookie_64(data: &[u8]) -> u64 {
    decode_binder_ptr_cookie_with(8, data)
}
fn decode_cookie_64(data: &[u8]) -> u64 {
    decode_cookie_with(8, data)
}

pub static ABI_32: BinderAbi = BinderAbi {
    version: BINDER_VERSION_32,
    pointer_size: 4,
    bc: BcOpcodes {
        transaction: bc_op(0, TX_SIZE_32),
        reply: bc_op(1, TX_SIZE_32),
        free_buffer: bc_op(3, 4),
        increfs: bc_op(4, 4),
        acquire: bc_op(5, 4),
        release: bc_op(6, 4),
        decrefs: bc_op(7, 4),
        increfs_done: bc_op(8, PTR_COOKIE_SIZE_32),
        acquire_done: bc_op(9, PTR_COOKIE_SIZE_32),
        enter_looper: bc_op(12, 0),
        exit_looper: bc_op(13, 0),
        request_death_notification: bc_op(14, DEATH_SIZE_32),
        clear_death_notification: bc_op(15, DEATH_SIZE_32),
        transaction_sg: bc_op(17, TX_SG_SIZE_32),
        reply_sg: bc_op(18, TX_SG_SIZE_32),
    },
    br: BrOpcodes {
        ok: br_op(1, 0),
        transaction: br_op(2, TX_SIZE_32),
        reply: br_op(3, TX_SIZE_32),
        dead_reply: br_op(5, 0),
        transaction_complete: br_op(6, 0),
        increfs: br_op(7, PTR_COOKIE_SIZE_32),
        acquire: br_op(8, PTR_COOKIE_SIZE_32),
        release: br_op(9, PTR_COOKIE_SIZE_32),
        decrefs: br_op(10, PTR_COOKIE_SIZE_32),
        noop: br_op(12, 0),
        spawn_looper: br_op(13, 0),
        finished: br_op(14, 0),
        dead_binder: br_op(15, 4),
        clear_death_notification_done: br_op(16, 0),
        failed_reply: br_op(17, 0),
    },
    encode_pointer: encode_pointer_32,
    encode_transaction: encode_transaction_32,
    encode_transaction_sg: encode_transaction_sg_32,
    encode_status_reply: encode_status_reply_32,
    encode_death_notification: encode_death_notification_32,
    decode_transaction_data: decode_transaction_data_32,
    decode_binder_ptr_cookie: decode_binder_ptr_cookie_32,
    decode_cookie: decode_cookie_32,
    write_read: write_read_32,
};

pub static ABI_64: BinderAbi = BinderAbi {
    version: BINDER_VERSION_64,
    pointer_size: 8,
    bc: BcOpcodes {
        transaction: bc_op(0, TX_SIZE_64),
        reply: bc_op(1, TX_SIZE_64),
        free_buffer: bc_op(3, 8),
        increfs: bc_op(4, 4),
        acquire: bc_op(5, 4),
        release: bc_op(6, 4),
        decrefs: bc_op(7, 4),
        increfs_done: bc_op(8, PTR_COOKIE_SIZE_64),
        acquire_done: bc_op(9, PTR_COOKIE_SIZE_64),
        enter_looper: bc_op(12, 0),
        exit_looper: bc_op(13, 0),
        request_death_notification: bc_op(14, DEATH_SIZE_64),
        clear_death_notification: bc_op(15, DEATH_SIZE_64),
        transaction_sg: bc_op(17, TX_SG_SIZE_64),
        reply_sg: bc_op(18, TX_SG_SIZE_64),
    },
    br: BrOpcodes {
        ok: br_op(1, 0),
        transaction: br_op(2, TX_SIZE_64),
        reply: br_op(3, TX_SIZE_64),
        dead_reply: br_op(5, 0),
        transaction_complete: br_op(6, 0),
        increfs: br_op(7, PTR_COOKIE_SIZE_64),
        acquire: br_op(8, PTR_COOKIE_SIZE_64),
        release: br_op(9, PTR_COOKIE_SIZE_64),
        decrefs: br_op(10, PTR_COOKIE_SIZE_64),
        noop: br_op(12, 0),
        spawn_looper: br_op(13, 0),
        finished: br_op(14, 0),
        dead_binder: br_op(15, 8),
        clear_death_notification_done: br_op(16, 0),
        failed_reply: br_op(17, 0),
    },
    encode_pointer: encode_pointer_64,
    encode_transaction: encode_transaction_64,
    encode_transaction_sg: encode_transaction_sg_64,
    encode_status_reply: encode_status_reply_64,
    encode_death_notification: encode_death_notification_64,
    decode_transaction_data: decode_transaction_data_64,
    decode_binder_ptr_cookie: decode_binder_ptr_cookie_64,
    decode_cookie: decode_cookie_64,
    write_read: write_read_64,
};
