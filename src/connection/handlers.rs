//! Table of message handlers indexed by opcode

use std::{fmt, os::unix::io::OwnedFd, sync::Arc};

use super::{Connection, ObjectData, ObjectId};
use crate::protocol::Message;

type Handler = Box<
    dyn Fn(&Connection, Message<ObjectId, OwnedFd>) -> Option<Arc<dyn ObjectData>> + Send + Sync,
>;

type DestroyedHandler = Box<dyn Fn(ObjectId) + Send + Sync>;

/// Object data dispatching each opcode to its own closure
///
/// Each object gets its own table, so handlers are effectively registered per
/// (object, opcode) pair. Messages with no registered handler are logged and dropped.
///
/// ```
/// use std::sync::Arc;
/// use wayland_wire::connection::OpcodeHandlers;
/// use wayland_wire::protocol::Argument;
///
/// let handlers = OpcodeHandlers::new().on(0, |_conn, msg| {
///     if let [Argument::Uint(serial)] = msg.args[..] {
///         println!("done: {serial}");
///     }
///     None
/// });
/// let _data: Arc<dyn wayland_wire::connection::ObjectData> = Arc::new(handlers);
/// ```
#[derive(Default)]
pub struct OpcodeHandlers {
    handlers: Vec<Option<Handler>>,
    on_destroyed: Option<DestroyedHandler>,
}

impl OpcodeHandlers {
    /// An empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the handler of an opcode, replacing the previous one
    pub fn on<F>(mut self, opcode: u16, handler: F) -> Self
    where
        F: Fn(&Connection, Message<ObjectId, OwnedFd>) -> Option<Arc<dyn ObjectData>>
            + Send
            + Sync
            + 'static,
    {
        let opcode = opcode as usize;
        if self.handlers.len() <= opcode {
            self.handlers.resize_with(opcode + 1, || None);
        }
        self.handlers[opcode] = Some(Box::new(handler));
        self
    }

    /// Set the closure invoked when the object is destroyed
    pub fn on_destroyed<F>(mut self, handler: F) -> Self
    where
        F: Fn(ObjectId) + Send + Sync + 'static,
    {
        self.on_destroyed = Some(Box::new(handler));
        self
    }

    /// Whether a handler is registered for this opcode
    pub fn handles(&self, opcode: u16) -> bool {
        matches!(self.handlers.get(opcode as usize), Some(Some(_)))
    }
}

impl fmt::Debug for OpcodeHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let opcodes =
            (0..self.handlers.len() as u16).filter(|&op| self.handles(op)).collect::<Vec<_>>();
        f.debug_struct("OpcodeHandlers").field("opcodes", &opcodes).finish_non_exhaustive()
    }
}

impl ObjectData for OpcodeHandlers {
    fn dispatch(
        self: Arc<Self>,
        conn: &Connection,
        msg: Message<ObjectId, OwnedFd>,
    ) -> Option<Arc<dyn ObjectData>> {
        match self.handlers.get(msg.opcode as usize) {
            Some(Some(handler)) => handler(conn, msg),
            _ => {
                log::warn!(
                    "No handler for opcode {} of {}, message dropped",
                    msg.opcode,
                    msg.sender_id
                );
                None
            }
        }
    }

    fn destroyed(&self, object_id: ObjectId) {
        if let Some(ref handler) = self.on_destroyed {
            handler(object_id);
        }
    }

    fn debug(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
