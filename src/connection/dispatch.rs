//! Reading, decoding and dispatching of incoming messages

use std::{
    io::ErrorKind,
    os::unix::io::OwnedFd,
    sync::{Arc, MutexGuard},
};

use smallvec::{smallvec, SmallVec};

use super::{Connection, Data, ObjectId, ProtocolState, Side, UninitObjectData};
use crate::{
    core_interfaces::{
        DISPLAY_DELETE_ID, DISPLAY_ERROR, DISPLAY_ID, DISPLAY_SYNC, WL_CALLBACK_INTERFACE,
    },
    debug,
    map::{InsertError, Lifecycle, Object, SERVER_ID_LIMIT},
    protocol::{
        accepts_interface, Argument, Interface, Message, MessageDesc, ProtocolError,
        ANONYMOUS_INTERFACE, INLINE_ARGS,
    },
    types::WaylandError,
    wire::{Header, MessageParseError},
};

type Args = SmallVec<[Argument<ObjectId, OwnedFd>; INLINE_ARGS]>;

/// Dispatch every message that can be read without blocking
///
/// The caller must hold the reader slot. The protocol lock is taken for each message and
/// released while its handler runs.
pub(super) fn dispatch_available(conn: &Connection) -> Result<usize, WaylandError> {
    let mut dispatched = 0;
    loop {
        let mut guard = conn.state.lock_protocol();
        guard.check_open()?;
        let header = match next_frame(&mut guard) {
            Ok(Some(header)) => header,
            Ok(None) => return Ok(dispatched),
            Err(e) => return Err(conn.fail(guard, e)),
        };
        if dispatch_one(conn, guard, header)? {
            dispatched += 1;
        }
    }
}

// Make sure a complete frame is buffered, reading from the socket as needed
//
// Returns `None` if the socket has no more data for now.
fn next_frame(state: &mut ProtocolState) -> Result<Option<Header>, WaylandError> {
    loop {
        match state.socket.peek_header() {
            Ok(Some(header)) if state.socket.pending_input() >= header.size => {
                return Ok(Some(header))
            }
            Ok(_) => {}
            Err(reason) => return Err(WaylandError::Malformed { object_id: 0, opcode: 0, reason }),
        }
        if let Err(e) = state.socket.fill_incoming_buffers() {
            return match e.kind() {
                ErrorKind::WouldBlock => Ok(None),
                // the peer left in the middle of a message
                ErrorKind::UnexpectedEof if state.socket.pending_input() > 0 => {
                    let (object_id, opcode) = match state.socket.peek_header() {
                        Ok(Some(header)) => (header.sender_id, header.opcode),
                        _ => (0, 0),
                    };
                    Err(WaylandError::Malformed {
                        object_id,
                        opcode,
                        reason: MessageParseError::MissingData,
                    })
                }
                _ => Err(e.into()),
            };
        }
    }
}

// Decode the buffered frame and hand it to its object
//
// Returns whether a handler was invoked.
fn dispatch_one(
    conn: &Connection,
    mut guard: MutexGuard<'_, ProtocolState>,
    header: Header,
) -> Result<bool, WaylandError> {
    let side = guard.side;

    // Resolve the target, zombies included so that their messages keep the stream in sync
    let receiver = match guard.map.find_any(header.sender_id) {
        Some(obj) => obj.clone(),
        None => return Err(conn.fail(guard, WaylandError::UnknownObject(header.sender_id))),
    };
    let message_desc = match side.incoming(receiver.interface).get(header.opcode as usize) {
        Some(desc) => desc,
        None => {
            let err = WaylandError::UnknownOpcode {
                interface: receiver.interface.name,
                object_id: header.sender_id,
                opcode: header.opcode,
            };
            return Err(conn.fail(guard, err));
        }
    };

    let message = match guard.socket.read_one_message(message_desc.signature) {
        Ok(msg) => msg,
        Err(reason) => {
            let err = WaylandError::Malformed {
                object_id: header.sender_id,
                opcode: header.opcode,
                reason,
            };
            return Err(conn.fail(guard, err));
        }
    };

    // Short-circuit the messages the connection handles itself
    if header.sender_id == DISPLAY_ID {
        match side {
            Side::Client => {
                if let Err(e) = handle_display_event(&mut guard, message) {
                    return Err(conn.fail(guard, e));
                }
                return Ok(false);
            }
            Side::Server if header.opcode == DISPLAY_SYNC => {
                if let Err(e) = handle_sync_request(&mut guard, message) {
                    return Err(conn.fail(guard, e));
                }
                return Ok(false);
            }
            Side::Server => {}
        }
    }

    // Convert the arguments and create the new object if applicable
    let (args, created_id) = match convert_args(&mut guard, &receiver, message_desc, message.args) {
        Ok(converted) => converted,
        Err(e) => return Err(conn.fail(guard, e)),
    };

    if guard.debug {
        debug::print_dispatched_message(
            receiver.interface.name,
            header.sender_id,
            message_desc.name,
            &args,
            receiver.is_zombie(),
        );
    }

    // If this message is sent to an already destroyed object, swallow it
    if receiver.is_zombie() {
        log::debug!(
            "Discarding {}@{}.{} sent to a destroyed object",
            receiver.interface.name,
            header.sender_id,
            message_desc.name
        );
        return Ok(false);
    }

    let id = ObjectId {
        id: header.sender_id,
        serial: receiver.data.serial,
        interface: receiver.interface,
    };

    // unlock the mutex while we invoke the user callback
    drop(guard);
    log::debug!("Dispatching {}.{} ({})", id, message_desc.name, debug::ArgList(&args));
    let ret = receiver
        .data
        .user_data
        .clone()
        .dispatch(conn, Message { sender_id: id.clone(), opcode: header.opcode, args });
    // lock it again to finish handling the message
    let mut guard = conn.state.lock_protocol();
    if guard.closed {
        // the handler closed the connection, all objects are gone already
        return Ok(true);
    }

    match (created_id, ret) {
        (Some(child_id), Some(child_data)) => {
            guard.map.with(child_id.id, |obj| {
                if obj.data.serial == child_id.serial {
                    obj.data.user_data = child_data;
                }
            });
        }
        (None, None) => {}
        (Some(child_id), None) => {
            log::warn!("Handler creating object {child_id} did not provide any object data");
        }
        (None, Some(_)) => {
            log::warn!("Object data returned by a handler not creating any object is ignored");
        }
    }

    // If this message is a destructor, destroy the object
    if message_desc.is_destructor {
        if let Err(e) = guard.destroy_object(id.id) {
            return Err(conn.fail(guard, e));
        }
        drop(guard);
        receiver.data.user_data.destroyed(id);
    }

    Ok(true)
}

fn convert_args(
    state: &mut ProtocolState,
    receiver: &Object<Data>,
    message_desc: &'static MessageDesc,
    raw_args: SmallVec<[Argument<u32, OwnedFd>; INLINE_ARGS]>,
) -> Result<(Args, Option<ObjectId>), WaylandError> {
    let mut created_id = None;
    let mut args = SmallVec::with_capacity(raw_args.len());
    let mut arg_interfaces = message_desc.arg_interfaces.iter();
    // a generic constructor announces the interface and version before the new id
    let mut last_str = None;
    let mut last_uint = None;
    for arg in raw_args {
        args.push(match arg {
            Argument::Int(i) => Argument::Int(i),
            Argument::Uint(u) => {
                last_uint = Some(u);
                Argument::Uint(u)
            }
            Argument::Fixed(f) => Argument::Fixed(f),
            Argument::Str(s) => {
                last_str = s.as_ref().map(|s| s.to_string_lossy().into_owned());
                Argument::Str(s)
            }
            Argument::Array(a) => Argument::Array(a),
            Argument::Fd(f) => Argument::Fd(f),
            Argument::Object(o) => {
                let next_interface = arg_interfaces.next();
                if o == 0 {
                    Argument::Object(ObjectId::null())
                } else {
                    // Lookup the object to make the appropriate Id
                    let obj = state.map.find_any(o).ok_or(WaylandError::UnknownObject(o))?;
                    if let Some(next_interface) = next_interface {
                        if !accepts_interface(next_interface, obj.interface) {
                            return Err(WaylandError::Protocol(ProtocolError {
                                code: crate::core_interfaces::display_error::INVALID_OBJECT,
                                object_id: o,
                                object_interface: obj.interface.name.into(),
                                message: format!(
                                    "object {o} was sent for an argument of interface {}, \
                                    but it has interface {}",
                                    next_interface.name, obj.interface.name
                                ),
                            }));
                        }
                    }
                    Argument::Object(ObjectId {
                        id: o,
                        serial: obj.data.serial,
                        interface: obj.interface,
                    })
                }
            }
            Argument::NewId(new_id) => {
                let (child_interface, child_version) = match message_desc.child_interface {
                    Some(iface) => (iface, receiver.version),
                    None => (
                        lookup_interface(&state.interfaces, last_str.as_deref()),
                        last_uint.unwrap_or(1),
                    ),
                };
                let child_id = register_new_id(
                    state,
                    new_id,
                    child_interface,
                    child_version,
                    receiver.is_zombie(),
                )?;
                created_id = Some(child_id.clone());
                Argument::NewId(child_id)
            }
        });
    }
    Ok((args, created_id))
}

fn lookup_interface(interfaces: &[&'static Interface], name: Option<&str>) -> &'static Interface {
    match name.and_then(|name| interfaces.iter().find(|iface| iface.name == name)) {
        Some(iface) => iface,
        None => {
            log::warn!("Peer created an object of unknown interface {name:?}");
            &ANONYMOUS_INTERFACE
        }
    }
}

// Register an object announced by the peer
fn register_new_id(
    state: &mut ProtocolState,
    new_id: u32,
    interface: &'static Interface,
    version: u32,
    zombie: bool,
) -> Result<ObjectId, WaylandError> {
    let invalid =
        |reason| WaylandError::InvalidNewId { interface: interface.name, id: new_id, reason };
    if new_id == 0 {
        return Err(invalid(InsertError::NullId));
    }
    if state.side.owns(new_id) {
        return Err(invalid(InsertError::ForeignRange(new_id)));
    }

    // if this ID belonged to a now destroyed server object, we can replace it
    if state.side == Side::Client
        && new_id >= SERVER_ID_LIMIT
        && state.map.find_any(new_id).is_some_and(Object::is_zombie)
    {
        state.map.remove(new_id);
    }

    let serial = state.next_serial();
    let mut child = Object::new(interface, version, Data::new(Arc::new(UninitObjectData), serial));
    if zombie {
        // created by a message to a destroyed object, it is born dead
        child.state = Lifecycle::Zombie;
    }
    state.map.insert_at(new_id, child).map_err(invalid)?;
    Ok(ObjectId { id: new_id, serial, interface })
}

fn handle_display_event(
    state: &mut ProtocolState,
    message: Message<u32, OwnedFd>,
) -> Result<(), WaylandError> {
    if state.debug {
        debug::print_dispatched_message(
            "wl_display",
            message.sender_id,
            if message.opcode == DISPLAY_ERROR { "error" } else { "delete_id" },
            &message.args,
            false,
        );
    }
    match (message.opcode, &message.args[..]) {
        (DISPLAY_ERROR, [Argument::Object(obj), Argument::Uint(code), Argument::Str(msg)]) => {
            let object_interface = state
                .map
                .find_any(*obj)
                .map(|obj| obj.interface.name)
                .unwrap_or("<unknown>");
            Err(WaylandError::Protocol(ProtocolError {
                code: *code,
                object_id: *obj,
                object_interface: object_interface.into(),
                message: msg.as_ref().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default(),
            }))
        }
        (DISPLAY_DELETE_ID, [Argument::Uint(id)]) => {
            let id = *id;
            match state.map.find_any(id) {
                Some(obj) if obj.is_zombie() => {
                    state.map.remove(id);
                }
                Some(_) => {
                    // destroyed by the server first, released once we destroy it too
                    state.map.with(id, |obj| obj.data.peer_released = true);
                }
                None => log::warn!("Server deleted unknown id {id}"),
            }
            Ok(())
        }
        // the decoder already enforced the signatures of both events
        _ => Ok(()),
    }
}

// `wl_display.sync` is answered right away: `done` then `delete_id`
fn handle_sync_request(
    state: &mut ProtocolState,
    message: Message<u32, OwnedFd>,
) -> Result<(), WaylandError> {
    if state.debug {
        debug::print_dispatched_message("wl_display", DISPLAY_ID, "sync", &message.args, false);
    }
    if let [Argument::NewId(callback)] = message.args[..] {
        register_new_id(state, callback, &WL_CALLBACK_INTERFACE, 1, false)?;
        let serial = state.next_serial();
        let done = smallvec![Argument::Uint(serial)];
        state.write_internal(&WL_CALLBACK_INTERFACE, callback, 0, done)?;
        state.destroy_object(callback)?;
    }
    Ok(())
}
