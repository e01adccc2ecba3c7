//! A pure rust runtime for the Wayland wire protocol
//!
//! This crate is the plumbing generated protocol bindings plug into. It provides:
//!
//! - the wire codec, in [`wire`]: encoding and decoding of messages from their
//!   [`MessageDesc`](protocol::MessageDesc) signature, file descriptors being carried
//!   alongside the byte stream,
//! - the object map, in [`map`]: association of protocol ids to objects, with the client and
//!   server id ranges and the destroyed-but-not-released state of ids,
//! - the [`Connection`](connection::Connection), which owns a unix socket and an object map,
//!   sends messages and dispatches the received ones to the
//!   [`ObjectData`](connection::ObjectData) of their target object.
//!
//! The connection runs either side of the protocol. Interfaces are described by static
//! [`Interface`](protocol::Interface) tables, as produced by a code generator; the three core
//! interfaces every connection needs are provided in [`core_interfaces`].
//!
//! ## Logging
//!
//! Every message sent or dispatched is logged at the `debug` level through the `log` crate,
//! fatal errors at the `error` level. Setting the `WAYLAND_DEBUG` environment variable to `1`,
//! `client` or `server` additionally prints a protocol trace on stderr, in the same format as
//! the system library.

#![warn(missing_docs, missing_debug_implementations)]
#![forbid(improper_ctypes, unsafe_op_in_unsafe_fn)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

/// Reexport of the `smallvec` crate, which is part of this crate's public API.
pub extern crate smallvec;

/// Helper macro for quickly making a [`Message`][crate::protocol::Message]
#[macro_export]
macro_rules! message {
    ($sender_id: expr, $opcode: expr, [$($args: expr),* $(,)?] $(,)?) => {
        $crate::protocol::Message {
            sender_id: $sender_id,
            opcode: $opcode,
            args: $crate::smallvec::smallvec![$($args),*],
        }
    }
}

pub mod connection;
pub mod core_interfaces;
mod debug;
pub mod map;
pub mod protocol;
pub mod socket;
pub mod types;
pub mod wire;

pub use connection::{Config, Connection, ObjectData, ObjectId, OpcodeHandlers, Side};
pub use types::{EncodingError, InvalidId, WaylandError};

#[cfg(test)]
mod test;
