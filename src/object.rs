use crate::reply::LocalReply;
use crate::request::RemoteRequest;

use std::sync::Arc;

/// How a local object relates to an inbound transaction code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionSupport {
    /// Not recognised; the dispatcher answers with a bad-message status.
    Unhandled,
    /// Handled inline on the looper thread.
    Looper,
    /// Handed to the user-supplied transaction handler.
    Supported,
}

/// Maps driver-provided identifiers to object records. Lookups happen on
/// every inbound refcount, transaction and death command.
pub trait ObjectRegistry {
    fn get_local(&self, ptr: u64) -> Option<Arc<dyn LocalObject>>;
    fn get_remote(&self, handle: u32) -> Option<Arc<dyn RemoteObject>>;
}

/// An object this process exposes to its peers.
pub trait LocalObject {
    fn can_handle_transaction(&self, iface: Option<&str>, code: u32) -> TransactionSupport;

    fn handle_looper_transaction(
        &self,
        req: &mut RemoteRequest,
        code: u32,
        flags: u32,
    ) -> (Option<LocalReply>, i32);

    fn handle_increfs(&self);
    fn handle_acquire(&self);
    fn handle_decrefs(&self);
    fn handle_release(&self);
}

/// A peer-owned object referenced through a handle.
pub trait RemoteObject {
    fn handle(&self) -> u32;

    /// Invoked once when the driver reports the owning process died.
    fn handle_death_notification(&self);
}

/// User-supplied sink for transactions the local object declared
/// supported.
pub trait TransactionHandler {
    fn transact(
        &self,
        obj: &dyn LocalObject,
        req: &mut RemoteRequest,
        code: u32,
        flags: u32,
    ) -> (Option<LocalReply>, i32);
}
