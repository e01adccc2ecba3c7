//! Error types of a Wayland connection

use crate::{
    map::InsertError,
    protocol::ProtocolError,
    wire::{MessageParseError, MessageWriteError},
};

/// An error that can occur when using a Wayland connection
///
/// Errors corrupting the framing of the stream are fatal: the connection is closed and
/// every object it held is invalidated. See [`WaylandError::is_fatal()`].
#[derive(Debug, thiserror::Error)]
pub enum WaylandError {
    /// A message could not be decoded
    #[error("Malformed message (object {object_id}, opcode {opcode}): {reason}")]
    Malformed {
        /// Object the message was addressed to
        object_id: u32,
        /// Opcode found in the header
        opcode: u16,
        /// What was wrong with the message
        #[source]
        reason: MessageParseError,
    },
    /// A message targets an object id that does not exist
    #[error("Message addressed to unknown object {0}")]
    UnknownObject(u32),
    /// A message uses an opcode its target's interface does not define
    #[error("Unknown opcode {opcode} for object {interface}@{object_id}")]
    UnknownOpcode {
        /// Interface of the target object
        interface: &'static str,
        /// Target object
        object_id: u32,
        /// The offending opcode
        opcode: u16,
    },
    /// The peer tried to create an object with an id it is not allowed to use
    #[error("Invalid new id {id} for an object of interface {interface}: {reason}")]
    InvalidNewId {
        /// Interface of the object being created
        interface: &'static str,
        /// The offending id
        id: u32,
        /// Why the id was refused
        #[source]
        reason: InsertError,
    },
    /// The server reported a protocol error
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// The connection encountered an IO error
    #[error("Io error: {0}")]
    Transport(#[from] std::io::Error),
    /// A message given by the caller could not be sent, the connection is unaffected
    #[error(transparent)]
    Encoding(#[from] EncodingError),
    /// The connection is already closed
    #[error("The connection is closed")]
    ConnectionClosed,
    /// Dispatching was re-entered from within a message handler
    #[error("Dispatching was re-entered from a message handler")]
    Reentrant,
}

impl WaylandError {
    /// Whether this error terminates the connection
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Malformed { .. }
            | Self::UnknownObject(_)
            | Self::UnknownOpcode { .. }
            | Self::InvalidNewId { .. }
            | Self::Protocol(_) => true,
            Self::Transport(e) => e.kind() != std::io::ErrorKind::WouldBlock,
            Self::Encoding(_) | Self::ConnectionClosed | Self::Reentrant => false,
        }
    }
}

impl Clone for WaylandError {
    fn clone(&self) -> Self {
        match self {
            Self::Malformed { object_id, opcode, reason } => {
                Self::Malformed { object_id: *object_id, opcode: *opcode, reason: reason.clone() }
            }
            Self::UnknownObject(id) => Self::UnknownObject(*id),
            Self::UnknownOpcode { interface, object_id, opcode } => {
                Self::UnknownOpcode {
                    interface: *interface,
                    object_id: *object_id,
                    opcode: *opcode,
                }
            }
            Self::InvalidNewId { interface, id, reason } => {
                Self::InvalidNewId { interface: *interface, id: *id, reason: *reason }
            }
            Self::Protocol(e) => Self::Protocol(e.clone()),
            Self::Transport(e) => Self::Transport(clone_io_error(e)),
            Self::Encoding(e) => Self::Encoding(e.clone()),
            Self::ConnectionClosed => Self::ConnectionClosed,
            Self::Reentrant => Self::Reentrant,
        }
    }
}

fn clone_io_error(e: &std::io::Error) -> std::io::Error {
    if let Some(code) = e.raw_os_error() {
        std::io::Error::from_raw_os_error(code)
    } else {
        std::io::Error::new(e.kind(), e.to_string())
    }
}

/// A message given by the caller is inconsistent with its declared interface
#[derive(Debug, thiserror::Error)]
pub enum EncodingError {
    /// The object id is null, unknown, stale or already destroyed
    #[error(transparent)]
    InvalidId(#[from] InvalidId),
    /// The opcode does not exist in the sender's interface
    #[error("Unknown opcode {opcode} for {interface}")]
    UnknownOpcode {
        /// Interface of the sender
        interface: &'static str,
        /// The offending opcode
        opcode: u16,
    },
    /// The message requires a newer version of the interface
    #[error("{interface}.{message} requires version {since}, object has version {version}")]
    Version {
        /// Interface of the sender
        interface: &'static str,
        /// Name of the message
        message: &'static str,
        /// Version introducing the message
        since: u32,
        /// Version of the sender
        version: u32,
    },
    /// An object argument has the wrong interface
    #[error("{interface}.{message} expects an object of interface {expected}, got {found}")]
    WrongInterface {
        /// Interface of the sender
        interface: &'static str,
        /// Name of the message
        message: &'static str,
        /// Declared interface of the argument
        expected: &'static str,
        /// Interface of the object given
        found: &'static str,
    },
    /// A new object was requested without an interface or without object data
    #[error("{interface}.{message} creates an object but {missing} was not provided")]
    MissingChild {
        /// Interface of the sender
        interface: &'static str,
        /// Name of the message
        message: &'static str,
        /// What was not provided
        missing: &'static str,
    },
    /// The new id argument neither is a placeholder nor an object created for this message
    #[error("The new id {0} is not a placeholder or a fresh object")]
    NotAPlaceholder(u32),
    /// The message is not valid for this side of the connection
    #[error("A {0} connection cannot send this kind of message")]
    WrongSide(&'static str),
    /// The message does not fit the wire format
    #[error("{interface}.{message}: {reason}")]
    Write {
        /// Interface of the sender
        interface: &'static str,
        /// Name of the message
        message: &'static str,
        /// Why serialization failed
        #[source]
        reason: MessageWriteError,
    },
}

impl Clone for EncodingError {
    fn clone(&self) -> Self {
        match self {
            Self::InvalidId(e) => Self::InvalidId(e.clone()),
            Self::UnknownOpcode { interface, opcode } => {
                Self::UnknownOpcode { interface: *interface, opcode: *opcode }
            }
            Self::Version { interface, message, since, version } => {
                Self::Version {
                    interface: *interface,
                    message: *message,
                    since: *since,
                    version: *version,
                }
            }
            Self::WrongInterface { interface, message, expected, found } => {
                Self::WrongInterface {
                    interface: *interface,
                    message: *message,
                    expected: *expected,
                    found: *found,
                }
            }
            Self::MissingChild { interface, message, missing } => {
                Self::MissingChild { interface: *interface, message: *message, missing: *missing }
            }
            Self::NotAPlaceholder(id) => Self::NotAPlaceholder(*id),
            Self::WrongSide(side) => Self::WrongSide(*side),
            Self::Write { interface, message, reason } => Self::Write {
                interface: *interface,
                message: *message,
                reason: match reason {
                    MessageWriteError::BufferTooSmall => MessageWriteError::BufferTooSmall,
                    MessageWriteError::TooBig(size) => MessageWriteError::TooBig(*size),
                    MessageWriteError::SignatureMismatch => MessageWriteError::SignatureMismatch,
                    MessageWriteError::NullNotAllowed(i) => MessageWriteError::NullNotAllowed(*i),
                    MessageWriteError::InvalidFd(i) => MessageWriteError::InvalidFd(*i),
                    MessageWriteError::DupFdFailed(e) => {
                        MessageWriteError::DupFdFailed(clone_io_error(e))
                    }
                },
            },
        }
    }
}

impl From<InvalidId> for WaylandError {
    fn from(err: InvalidId) -> Self {
        Self::Encoding(EncodingError::InvalidId(err))
    }
}

/// An error generated when trying to act on an invalid `ObjectId`.
#[derive(Clone, Debug, thiserror::Error)]
#[error("Invalid ObjectId")]
pub struct InvalidId;
