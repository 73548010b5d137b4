use crate::buffer::KernelBuffer;
use crate::parcel::Parcel;
use crate::protocol::RpcProtocol;

use std::ops::{Deref, DerefMut};

/// An outbound request payload under construction. Derefs to the
/// underlying [`Parcel`] for writing; usually created through
/// `Driver::local_request_new`, which prefixes the dialect header.
pub struct LocalRequest {
    parcel: Parcel,
}

impl LocalRequest {
    pub fn new() -> Self {
        Self {
            parcel: Parcel::empty(),
        }
    }
}

impl Default for LocalRequest {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for LocalRequest {
    type Target = Parcel;

    fn deref(&self) -> &Parcel {
        &self.parcel
    }
}

impl DerefMut for LocalRequest {
    fn deref_mut(&mut self) -> &mut Parcel {
        &mut self.parcel
    }
}

/// An inbound transaction as delivered by the driver: sender
/// credentials, the dialect-extracted interface token, and the
/// kernel-lent payload. Owns the payload buffer; dropping the request
/// returns it to the driver.
pub struct RemoteRequest {
    protocol: &'static dyn RpcProtocol,
    pid: i32,
    euid: u32,
    iface: Option<String>,
    header_len: usize,
    data: Option<KernelBuffer>,
    offsets: Vec<usize>,
}

impl RemoteRequest {
    pub(crate) fn new(protocol: &'static dyn RpcProtocol, pid: i32, euid: u32) -> Self {
        Self {
            protocol,
            pid,
            euid,
            iface: None,
            header_len: 0,
            data: None,
            offsets: Vec::new(),
        }
    }

    pub(crate) fn set_data(&mut self, buf: KernelBuffer, offsets: Vec<usize>) {
        if let Some((iface, header_len)) = self.protocol.extract_interface(buf.as_slice()) {
            self.iface = Some(iface);
            self.header_len = header_len;
        }
        self.data = Some(buf);
        self.offsets = offsets;
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn euid(&self) -> u32 {
        self.euid
    }

    pub fn interface(&self) -> Option<&str> {
        self.iface.as_deref()
    }

    /// The payload past the dialect header.
    pub fn data(&self) -> &[u8] {
        &self.raw_data()[self.header_len..]
    }

    /// The payload as delivered, dialect header included.
    pub fn raw_data(&self) -> &[u8] {
        self.data.as_ref().map_or(&[], |b| b.as_slice())
    }

    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }
}
