use crate::abi::{payload_len, READ_BUFFER_SIZE};
use crate::driver::Driver;

use byteorder::{ByteOrder, LittleEndian};

/// The driver's view of a contiguous byte range. On the write side the
/// kernel advances `consumed` as it accepts commands; on the read side it
/// appends delivered packets at `consumed` and advances it.
#[derive(Debug, Default, Clone)]
pub struct IoBuf {
    pub ptr: usize,
    pub size: usize,
    pub consumed: usize,
}

/// Peeks the next complete command packet: a 32-bit code whose low 16
/// bits declare the payload length. Returns `None` when the remaining
/// bytes hold no packet or only part of one.
pub fn next_command(data: &[u8]) -> Option<u32> {
    if data.len() < 4 {
        return None;
    }
    let cmd = LittleEndian::read_u32(data);
    if data.len() >= 4 + payload_len(cmd) {
        Some(cmd)
    } else {
        None
    }
}

/// Scratch storage handed to the driver on every read, plus the fill
/// level. Unparsed tail bytes are moved to the head between reads so the
/// next syscall appends to them.
pub struct ReadBuf {
    data: [u8; READ_BUFFER_SIZE],
    filled: usize,
}

impl ReadBuf {
    pub fn new() -> Self {
        Self {
            data: [0; READ_BUFFER_SIZE],
            filled: 0,
        }
    }

    pub fn io_buf(&mut self) -> IoBuf {
        IoBuf {
            ptr: self.data.as_mut_ptr() as usize,
            size: READ_BUFFER_SIZE,
            consumed: self.filled,
        }
    }

    pub fn set_filled(&mut self, filled: usize) {
        debug_assert!(filled <= READ_BUFFER_SIZE);
        self.filled = filled;
    }

    pub fn filled(&self) -> usize {
        self.filled
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.filled]
    }

    /// Drops the first `processed` bytes and moves the tail to the head.
    pub fn shift_tail(&mut self, processed: usize) {
        debug_assert!(processed <= self.filled);
        self.data.copy_within(processed..self.filled, 0);
        self.filled -= processed;
    }

    #[cfg(test)]
    pub(crate) fn feed(&mut self, bytes: &[u8]) {
        self.data[self.filled..self.filled + bytes.len()].copy_from_slice(bytes);
        self.filled += bytes.len();
    }
}

impl Default for ReadBuf {
    fn default() -> Self {
        Self::new()
    }
}

/// A chunk of the receive mapping lent to user space by the kernel for
/// one transaction. Dropping the holder returns the chunk with a
/// free-buffer command; a null holder releases nothing.
pub struct KernelBuffer {
    driver: Driver,
    ptr: usize,
    size: usize,
}

impl KernelBuffer {
    pub(crate) fn new(driver: Driver, ptr: usize, size: usize) -> Self {
        Self { driver, ptr, size }
    }

    pub fn ptr(&self) -> usize {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0 || self.ptr == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        if self.is_empty() {
            &[]
        } else {
            unsafe { std::slice::from_raw_parts(self.ptr as *const u8, self.size) }
        }
    }
}

impl Drop for KernelBuffer {
    fn drop(&mut self) {
        if self.ptr != 0 {
            if let Err(err) = self.driver.free_buffer(self.ptr) {
                warn!("failed to return kernel buffer {:#x}: {}", self.ptr, err);
            }
        }
    }
}
