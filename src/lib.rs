//! User-space session for the Android Binder kernel driver: opens a
//! binder character device, negotiates the kernel ABI, maps the receive
//! region and runs the command loop that carries synchronous and
//! one-way transactions.

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate log;

mod abi;
pub use abi::*;

mod buffer;
pub use buffer::*;

mod driver;
pub use driver::*;

mod object;
pub use object::*;

mod parcel;
pub use parcel::*;

mod protocol;
pub use protocol::*;

mod reply;
pub use reply::*;

mod request;
pub use request::*;

use nix::errno::Errno;
use thiserror::Error;

/// Session-level transaction statuses. Anything else a transaction
/// returns is the kernel-reported status from the reply envelope.
pub mod status {
    pub const OK: i32 = 0;
    pub const FAILED: i32 = 1;
    pub const DEAD_OBJECT: i32 = 2;
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("can't open {dev}: {err}")]
    Open { dev: String, err: Errno },
    #[error("can't get binder version from {dev}: {err}")]
    Version { dev: String, err: Errno },
    #[error("{dev} unexpected version {version}")]
    UnsupportedVersion { dev: String, version: i32 },
    #[error("{dev} failed to mmap: {err}")]
    Mmap { dev: String, err: Errno },
    #[error("io error")]
    Io(#[from] std::io::Error),
    #[error("utf-16 error")]
    Utf16(#[from] std::string::FromUtf16Error),
    #[error("utf-8 error")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("deserialization error")]
    Deserialization,
}
