use crate::buffer::KernelBuffer;
use crate::parcel::Parcel;

use std::ops::{Deref, DerefMut};

/// A reply assembled locally for a two-way inbound transaction. Derefs
/// to the underlying [`Parcel`] for writing.
pub struct LocalReply {
    parcel: Parcel,
}

impl LocalReply {
    pub fn new() -> Self {
        Self {
            parcel: Parcel::empty(),
        }
    }
}

impl Default for LocalReply {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for LocalReply {
    type Target = Parcel;

    fn deref(&self) -> &Parcel {
        &self.parcel
    }
}

impl DerefMut for LocalReply {
    fn deref_mut(&mut self) -> &mut Parcel {
        &mut self.parcel
    }
}

/// The caller's sink for a two-way transaction. Left empty unless the
/// driver delivered reply data; holds the kernel buffer, which is
/// returned to the driver when the reply is dropped.
#[derive(Default)]
pub struct RemoteReply {
    data: Option<KernelBuffer>,
    offsets: Vec<usize>,
}

impl RemoteReply {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set_data(&mut self, buf: KernelBuffer, offsets: Vec<usize>) {
        self.data = Some(buf);
        self.offsets = offsets;
    }

    pub fn data(&self) -> &[u8] {
        self.data.as_ref().map_or(&[], |b| b.as_slice())
    }

    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    pub fn is_empty(&self) -> bool {
        self.data.as_ref().map_or(true, |b| b.is_empty())
    }
}
