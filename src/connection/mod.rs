//! A Wayland connection, for either side of the protocol
//!
//! [`Connection`] owns the socket and the object map of one connection. It serializes
//! outgoing messages, reads and decodes incoming ones and dispatches them to the
//! [`ObjectData`] associated with their target object.
//!
//! The same type is used by clients and servers, the [`Side`] given in its [`Config`]
//! decides which messages are sent (requests or events), which ones are received, and which
//! range of ids is allocated locally.

use std::{
    ffi::CString,
    fmt,
    os::unix::{
        io::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd},
        net::UnixStream,
    },
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex, MutexGuard,
    },
    thread::{self, ThreadId},
};

use rustix::event::{poll, PollFd, PollFlags};
use smallvec::{smallvec, SmallVec};

use crate::{
    core_interfaces::{
        display_error, DISPLAY_DELETE_ID, DISPLAY_ERROR, DISPLAY_ID, DISPLAY_SYNC,
        WL_DISPLAY_INTERFACE,
    },
    debug,
    map::{Object, ObjectMap, SERVER_ID_LIMIT},
    protocol::{
        accepts_interface, args_match_signature, same_interface, Argument, Interface, Message,
        MessageDesc, ObjectInfo, ProtocolError, ANONYMOUS_INTERFACE, INLINE_ARGS,
    },
    socket::{BufferedSocket, Socket, WriteError},
    types::{EncodingError, InvalidId, WaylandError},
};

mod dispatch;
mod handlers;

pub use handlers::OpcodeHandlers;

/// The side of the protocol a connection plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Sends requests, receives events, allocates ids below [`SERVER_ID_LIMIT`]
    Client,
    /// Sends events, receives requests, allocates ids from [`SERVER_ID_LIMIT`] upward
    Server,
}

impl Side {
    /// Name of this side, as accepted by the `WAYLAND_DEBUG` variable
    pub fn name(&self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Server => "server",
        }
    }

    /// Messages this side sends on objects of the given interface
    pub fn outgoing(&self, interface: &'static Interface) -> &'static [MessageDesc] {
        match self {
            Self::Client => interface.requests,
            Self::Server => interface.events,
        }
    }

    /// Messages this side receives on objects of the given interface
    pub fn incoming(&self, interface: &'static Interface) -> &'static [MessageDesc] {
        match self {
            Self::Client => interface.events,
            Self::Server => interface.requests,
        }
    }

    /// Whether the id belongs to the range allocated by this side
    pub fn owns(&self, id: u32) -> bool {
        match self {
            Self::Client => id != 0 && id < SERVER_ID_LIMIT,
            Self::Server => id >= SERVER_ID_LIMIT,
        }
    }
}

/// Configuration of a [`Connection`]
#[derive(Debug, Clone)]
pub struct Config {
    /// Side of the protocol played by the connection
    pub side: Side,
    /// Print every message to stderr, in the `WAYLAND_DEBUG` format
    pub debug: bool,
    /// Interfaces available to objects created by a generic constructor
    ///
    /// When the peer creates an object through a message that does not declare the
    /// interface of the new object (such as `wl_registry.bind`), the interface is looked up
    /// by name in this list.
    pub interfaces: Vec<&'static Interface>,
}

impl Config {
    /// Configuration of a client, debug output follows `WAYLAND_DEBUG`
    pub fn client() -> Self {
        let debug = debug::has_debug_env(Side::Client);
        Self { side: Side::Client, debug, interfaces: Vec::new() }
    }

    /// Configuration of a server, debug output follows `WAYLAND_DEBUG`
    pub fn server() -> Self {
        let debug = debug::has_debug_env(Side::Server);
        Self { side: Side::Server, debug, interfaces: Vec::new() }
    }

    /// Force the debug output on or off
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Add interfaces that generic constructors may create
    pub fn with_interfaces(
        mut self,
        interfaces: impl IntoIterator<Item = &'static Interface>,
    ) -> Self {
        self.interfaces.extend(interfaces);
        self
    }
}

/// Behaviour attached to an object: the handler of its incoming messages
///
/// The data is shared behind an `Arc`, state it keeps needs interior mutability. It can be
/// downcast back to its concrete type, see [`Connection::get_data()`].
pub trait ObjectData: downcast_rs::DowncastSync {
    /// Handle a message received by the object
    ///
    /// Runs without any lock of the connection held, so that it can send messages. When the
    /// message creates an object, the returned data is attached to it; returning `None` in
    /// that case leaves the new object without a handler.
    fn dispatch(
        self: Arc<Self>,
        conn: &Connection,
        msg: Message<ObjectId, OwnedFd>,
    ) -> Option<Arc<dyn ObjectData>>;

    /// Called once the object is destroyed, by a destructor or by the connection closing
    fn destroyed(&self, _object_id: ObjectId) {}

    /// `Debug` rendering of the data, `ObjectData { .. }` unless overridden
    fn debug(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectData").finish_non_exhaustive()
    }
}

impl fmt::Debug for dyn ObjectData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.debug(f)
    }
}

downcast_rs::impl_downcast!(sync ObjectData);

/// An ID representing a Wayland object
///
/// Protocol ids are reused once an object is released, the serial carried by this handle
/// makes sure it never designates a later object reusing the same id.
#[derive(Clone)]
pub struct ObjectId {
    id: u32,
    serial: u32,
    interface: &'static Interface,
}

impl ObjectId {
    /// The null id, also used as the placeholder for `NewId` arguments of outgoing messages
    pub fn null() -> Self {
        Self { id: 0, serial: 0, interface: &ANONYMOUS_INTERFACE }
    }

    /// Check if this is the null ID
    #[inline]
    pub fn is_null(&self) -> bool {
        self.id == 0
    }

    /// Interface of the represented object
    #[inline]
    pub fn interface(&self) -> &'static Interface {
        self.interface
    }

    /// Return the protocol-level numerical ID of this object
    #[inline]
    pub fn protocol_id(&self) -> u32 {
        self.id
    }
}

impl PartialEq for ObjectId {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.serial == other.serial
            && same_interface(self.interface, other.interface)
    }
}

impl Eq for ObjectId {}

impl std::hash::Hash for ObjectId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.serial.hash(state);
        self.id.hash(state);
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.interface.name, self.id)
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({}, {})", self, self.serial)
    }
}

#[derive(Debug, Clone)]
struct Data {
    user_data: Arc<dyn ObjectData>,
    serial: u32,
    // created with `create_object` and not announced to the peer yet
    pending: bool,
    // the peer acknowledged the destruction with `wl_display.delete_id`
    peer_released: bool,
}

impl Data {
    fn new(user_data: Arc<dyn ObjectData>, serial: u32) -> Self {
        Self { user_data, serial, pending: false, peer_released: false }
    }
}

#[derive(Debug)]
struct ProtocolState {
    side: Side,
    socket: BufferedSocket,
    map: ObjectMap<Data>,
    interfaces: Vec<&'static Interface>,
    last_error: Option<WaylandError>,
    last_serial: u32,
    closed: bool,
    debug: bool,
}

#[derive(Debug)]
struct ReadingState {
    reader: Option<ThreadId>,
    read_serial: usize,
}

#[derive(Debug)]
struct ConnectionState {
    protocol: Mutex<ProtocolState>,
    read: Mutex<ReadingState>,
    read_condvar: Condvar,
}

impl ConnectionState {
    fn lock_protocol(&self) -> MutexGuard<'_, ProtocolState> {
        self.protocol.lock().unwrap()
    }

    fn lock_read(&self) -> MutexGuard<'_, ReadingState> {
        self.read.lock().unwrap()
    }
}

/// A connection to a Wayland peer
///
/// This is a cheap handle, clones refer to the same connection and can be sent to other
/// threads. Sending a message is atomic: messages sent concurrently from several threads
/// never interleave on the wire.
#[derive(Clone, Debug)]
pub struct Connection {
    state: Arc<ConnectionState>,
}

impl PartialEq for Connection {
    fn eq(&self, rhs: &Self) -> bool {
        Arc::ptr_eq(&self.state, &rhs.state)
    }
}

impl Eq for Connection {}

impl Connection {
    /// Initialize a connection on an established unix stream
    ///
    /// `display_data` handles the messages received by the `wl_display` object that are not
    /// processed by the connection itself.
    pub fn new(stream: UnixStream, config: Config, display_data: Arc<dyn ObjectData>) -> Self {
        let socket = BufferedSocket::new(Socket::from(stream));
        let mut map = ObjectMap::new();
        // the first client id of an empty map is the display
        let display_id = {
            let display = Object::new(&WL_DISPLAY_INTERFACE, 1, Data::new(display_data, 0));
            map.client_insert_new(display)
        };
        debug_assert_eq!(display_id, DISPLAY_ID);

        log::debug!("New {} connection", config.side.name());

        Self {
            state: Arc::new(ConnectionState {
                protocol: Mutex::new(ProtocolState {
                    side: config.side,
                    socket,
                    map,
                    interfaces: config.interfaces,
                    last_error: None,
                    last_serial: 0,
                    closed: false,
                    debug: config.debug,
                }),
                read: Mutex::new(ReadingState { reader: None, read_serial: 0 }),
                read_condvar: Condvar::new(),
            }),
        }
    }

    /// Connect as a client on an established unix stream
    pub fn connect(stream: UnixStream) -> Self {
        Self::new(stream, Config::client(), Arc::new(DumbObjectData))
    }

    /// Serve a client on an accepted unix stream
    pub fn accept(stream: UnixStream, display_data: Arc<dyn ObjectData>) -> Self {
        Self::new(stream, Config::server(), display_data)
    }

    /// Side of the protocol played by this connection
    pub fn side(&self) -> Side {
        self.state.lock_protocol().side
    }

    /// Id of the `wl_display` object
    pub fn display_id(&self) -> ObjectId {
        ObjectId { id: DISPLAY_ID, serial: 0, interface: &WL_DISPLAY_INTERFACE }
    }

    /// Whether the connection was closed
    pub fn is_closed(&self) -> bool {
        self.state.lock_protocol().closed
    }

    /// The fatal error that closed the connection, if any
    pub fn last_error(&self) -> Option<WaylandError> {
        self.state.lock_protocol().last_error.clone()
    }

    /// The socket fd, to wait for incoming messages in an event loop
    pub fn poll_fd(&self) -> BorrowedFd<'_> {
        let raw_fd = self.state.lock_protocol().socket.as_raw_fd();
        // SAFETY: the socket is only closed when the state is dropped, `self` keeps it alive
        unsafe { BorrowedFd::borrow_raw(raw_fd) }
    }

    /// Get the protocol information of a living object
    pub fn object_info(&self, id: &ObjectId) -> Result<ObjectInfo, InvalidId> {
        let object = self.state.lock_protocol().get_object(id)?;
        Ok(ObjectInfo { id: id.id, interface: object.interface, version: object.version })
    }

    /// Get the object data of an object, destroyed objects whose id is not released yet
    /// included
    pub fn get_data(&self, id: &ObjectId) -> Result<Arc<dyn ObjectData>, InvalidId> {
        let guard = self.state.lock_protocol();
        match guard.map.find_any(id.id) {
            Some(object) if object.data.serial == id.serial => Ok(object.data.user_data.clone()),
            _ => Err(InvalidId),
        }
    }

    /// Replace the object data of a living object
    pub fn set_data(&self, id: &ObjectId, data: Arc<dyn ObjectData>) -> Result<(), InvalidId> {
        self.state
            .lock_protocol()
            .map
            .with(id.id, move |object| {
                if object.data.serial != id.serial || object.is_zombie() {
                    Err(InvalidId)
                } else {
                    object.data.user_data = data;
                    Ok(())
                }
            })
            .unwrap_or(Err(InvalidId))
    }

    /// Create an object in the local id range without announcing it
    ///
    /// The returned id can then be given as the `NewId` argument of an outgoing message
    /// instead of the null placeholder.
    pub fn create_object(
        &self,
        interface: &'static Interface,
        version: u32,
        data: Arc<dyn ObjectData>,
    ) -> Result<ObjectId, WaylandError> {
        let mut guard = self.state.lock_protocol();
        guard.check_open()?;
        let serial = guard.next_serial();
        let mut object_data = Data::new(data, serial);
        object_data.pending = true;
        let object = Object::new(interface, version, object_data);
        let id = match guard.side {
            Side::Client => guard.map.client_insert_new(object),
            Side::Server => guard.map.server_insert_new(object),
        };
        Ok(ObjectId { id, serial, interface })
    }

    /// Send a request
    ///
    /// If the request creates an object, its `NewId` argument is either
    /// [`ObjectId::null()`], in which case an id is allocated for the child and `data` is
    /// attached to it, or an id obtained from [`create_object()`](Self::create_object).
    /// `child_spec` gives the interface and version of the child, and is required when the
    /// request does not declare the interface it creates.
    ///
    /// Returns the id of the created object, or the null id if the request creates none.
    pub fn send_request(
        &self,
        msg: Message<ObjectId, RawFd>,
        data: Option<Arc<dyn ObjectData>>,
        child_spec: Option<(&'static Interface, u32)>,
    ) -> Result<ObjectId, WaylandError> {
        self.send_message(Side::Client, msg, data, child_spec)
    }

    /// Send an event
    ///
    /// Works like [`send_request()`](Self::send_request), for server connections.
    pub fn send_event(
        &self,
        msg: Message<ObjectId, RawFd>,
        data: Option<Arc<dyn ObjectData>>,
        child_spec: Option<(&'static Interface, u32)>,
    ) -> Result<ObjectId, WaylandError> {
        self.send_message(Side::Server, msg, data, child_spec)
    }

    fn send_message(
        &self,
        expected: Side,
        Message { sender_id: id, opcode, args }: Message<ObjectId, RawFd>,
        data: Option<Arc<dyn ObjectData>>,
        child_spec: Option<(&'static Interface, u32)>,
    ) -> Result<ObjectId, WaylandError> {
        let mut guard = self.state.lock_protocol();
        guard.check_open()?;
        if guard.side != expected {
            return Err(EncodingError::WrongSide(guard.side.name()).into());
        }

        let object = guard.get_object(&id)?;
        let message_desc = guard
            .side
            .outgoing(object.interface)
            .get(opcode as usize)
            .ok_or(EncodingError::UnknownOpcode { interface: object.interface.name, opcode })?;

        if message_desc.since > object.version {
            return Err(EncodingError::Version {
                interface: object.interface.name,
                message: message_desc.name,
                since: message_desc.since,
                version: object.version,
            }
            .into());
        }

        if !args_match_signature(message_desc.signature, &args) {
            return Err(EncodingError::Write {
                interface: object.interface.name,
                message: message_desc.name,
                reason: crate::wire::MessageWriteError::SignatureMismatch,
            }
            .into());
        }

        // Check the object arguments
        let mut arg_interfaces = message_desc.arg_interfaces.iter();
        for arg in &args {
            if let Argument::Object(o) = arg {
                let next_interface = arg_interfaces.next();
                if o.is_null() {
                    continue;
                }
                let arg_object = guard.get_object(o)?;
                if let Some(next_interface) = next_interface {
                    if !accepts_interface(next_interface, arg_object.interface) {
                        return Err(EncodingError::WrongInterface {
                            interface: object.interface.name,
                            message: message_desc.name,
                            expected: next_interface.name,
                            found: arg_object.interface.name,
                        }
                        .into());
                    }
                }
            }
        }

        // Prepare the child object
        let new_id = args.iter().find_map(|arg| match arg {
            Argument::NewId(id) => Some(id.clone()),
            _ => None,
        });
        let mut allocated = false;
        let child = match new_id {
            None => None,
            Some(placeholder) if placeholder.is_null() => {
                let (child_interface, child_version) =
                    match (child_spec, message_desc.child_interface) {
                        (Some((iface, version)), Some(declared)) => {
                            if !same_interface(declared, iface) {
                                return Err(EncodingError::WrongInterface {
                                    interface: object.interface.name,
                                    message: message_desc.name,
                                    expected: declared.name,
                                    found: iface.name,
                                }
                                .into());
                            }
                            (iface, version)
                        }
                        (Some(spec), None) => spec,
                        (None, Some(declared)) => (declared, object.version),
                        (None, None) => {
                            return Err(EncodingError::MissingChild {
                                interface: object.interface.name,
                                message: message_desc.name,
                                missing: "the interface of the new object",
                            }
                            .into())
                        }
                    };
                let data = data.ok_or(EncodingError::MissingChild {
                    interface: object.interface.name,
                    message: message_desc.name,
                    missing: "object data",
                })?;
                let child_serial = guard.next_serial();
                let child_data = Data::new(data, child_serial);
                let child = Object::new(child_interface, child_version, child_data);
                let child_id = match guard.side {
                    Side::Client => guard.map.client_insert_new(child),
                    Side::Server => guard.map.server_insert_new(child),
                };
                allocated = true;
                Some(ObjectId { id: child_id, serial: child_serial, interface: child_interface })
            }
            Some(existing) => {
                let side = guard.side;
                let fresh = guard.map.find(existing.id).is_some_and(|obj| {
                    obj.data.serial == existing.serial && obj.data.pending && side.owns(existing.id)
                });
                if !fresh {
                    return Err(EncodingError::NotAPlaceholder(existing.id).into());
                }
                if let Some(declared) = message_desc.child_interface {
                    if !same_interface(declared, existing.interface) {
                        return Err(EncodingError::WrongInterface {
                            interface: object.interface.name,
                            message: message_desc.name,
                            expected: declared.name,
                            found: existing.interface.name,
                        }
                        .into());
                    }
                }
                Some(existing)
            }
        };

        let child_protocol_id = child.as_ref().map_or(0, |child| child.id);
        let msg_args = args
            .into_iter()
            .map(|arg| match arg {
                Argument::Int(i) => Argument::Int(i),
                Argument::Uint(u) => Argument::Uint(u),
                Argument::Fixed(f) => Argument::Fixed(f),
                Argument::Str(s) => Argument::Str(s),
                Argument::Array(a) => Argument::Array(a),
                Argument::Fd(f) => Argument::Fd(f),
                Argument::Object(o) => Argument::Object(o.id),
                Argument::NewId(_) => Argument::NewId(child_protocol_id),
            })
            .collect::<SmallVec<[_; INLINE_ARGS]>>();

        if guard.debug {
            debug::print_send_message(object.interface.name, id.id, message_desc.name, &msg_args);
        }
        log::debug!("Sending {}.{} ({})", id, message_desc.name, debug::ArgList(&msg_args));

        // Send the message
        let msg = Message { sender_id: id.id, opcode, args: msg_args };
        match guard.socket.write_message(&msg, message_desc.signature) {
            Ok(()) => {}
            Err(WriteError::Message(reason)) => {
                if allocated {
                    guard.map.remove(child_protocol_id);
                }
                return Err(EncodingError::Write {
                    interface: object.interface.name,
                    message: message_desc.name,
                    reason,
                }
                .into());
            }
            Err(WriteError::Io(e)) => return Err(self.fail(guard, e.into())),
        }

        if !allocated && child_protocol_id != 0 {
            guard.map.with(child_protocol_id, |obj| obj.data.pending = false);
        }

        // Handle destruction if relevant
        if message_desc.is_destructor {
            if let Err(e) = guard.destroy_object(id.id) {
                return Err(self.fail(guard, e));
            }
            drop(guard);
            object.data.user_data.destroyed(id);
        }

        Ok(child.unwrap_or_else(ObjectId::null))
    }

    /// Flush all pending outgoing messages to the peer
    ///
    /// Blocks until the socket accepted all of them.
    pub fn flush(&self) -> Result<(), WaylandError> {
        let mut guard = self.state.lock_protocol();
        guard.check_open()?;
        if let Err(e) = guard.socket.flush_blocking() {
            return Err(self.fail(guard, e.into()));
        }
        Ok(())
    }

    /// Dispatch the messages that can be read without blocking
    ///
    /// Returns the number of messages given to object handlers. If another thread is
    /// dispatching, waits for it to finish first, which includes a thread blocked in
    /// [`blocking_dispatch()`](Self::blocking_dispatch) until the peer sends something.
    /// Calling this from a handler returns [`WaylandError::Reentrant`].
    pub fn dispatch_pending(&self) -> Result<usize, WaylandError> {
        let _reader = ReaderSlot::acquire(&self.state)?;
        dispatch::dispatch_available(self)
    }

    /// Flush the outgoing messages, then wait until at least one message is dispatched
    ///
    /// Returns `0` without waiting if another thread was dispatching when this was called,
    /// as it may have handled the messages this thread was waiting for. The reading slot is
    /// held while waiting for the socket, so other threads wanting to dispatch wait too.
    pub fn blocking_dispatch(&self) -> Result<usize, WaylandError> {
        self.flush()?;
        let (_reader, waited) = ReaderSlot::acquire_waiting(&self.state)?;
        if waited {
            return Ok(0);
        }
        loop {
            let dispatched = dispatch::dispatch_available(self)?;
            if dispatched > 0 {
                return Ok(dispatched);
            }
            // messages answered by the connection itself may be waiting in the buffer
            self.flush()?;
            self.wait_readable()?;
        }
    }

    /// Block until the peer acknowledged every request sent so far
    ///
    /// Sends a `wl_display.sync` request and dispatches messages until its callback is done.
    /// Returns the number of messages dispatched in the process.
    pub fn roundtrip(&self) -> Result<usize, WaylandError> {
        let done = Arc::new(SyncData::default());
        let msg =
            crate::message!(self.display_id(), DISPLAY_SYNC, [Argument::NewId(ObjectId::null())]);
        self.send_request(msg, Some(done.clone()), None)?;
        let mut dispatched = 0;
        while !done.done.load(Ordering::Acquire) {
            dispatched += self.blocking_dispatch()?;
        }
        Ok(dispatched)
    }

    /// Post a protocol error and close the connection
    ///
    /// Only servers can post errors. The error is sent as a `wl_display.error` event about
    /// `object`, and kept as the [`last_error()`](Self::last_error) of the connection.
    pub fn post_error(
        &self,
        object: &ObjectId,
        code: u32,
        message: impl Into<String>,
    ) -> Result<(), WaylandError> {
        let mut guard = self.state.lock_protocol();
        guard.check_open()?;
        if guard.side != Side::Server {
            return Err(EncodingError::WrongSide(guard.side.name()).into());
        }
        let message = message.into();
        guard.send_display_error(object.id, code, &message);
        if let Err(e) = guard.socket.flush() {
            log::warn!("Failed to flush the protocol error: {e}");
        }
        guard.last_error = Some(WaylandError::Protocol(ProtocolError {
            code,
            object_id: object.id,
            object_interface: object.interface.name.into(),
            message,
        }));
        let dead = guard.teardown();
        drop(guard);
        notify_destroyed(dead);
        Ok(())
    }

    /// Close the connection
    ///
    /// Pending outgoing messages are flushed if the socket accepts them without blocking.
    /// Every object still alive is destroyed.
    pub fn close(&self) {
        let mut guard = self.state.lock_protocol();
        if guard.closed {
            return;
        }
        let _ = guard.socket.flush();
        log::debug!("Closing {} connection", guard.side.name());
        let dead = guard.teardown();
        drop(guard);
        notify_destroyed(dead);
    }

    // store a fatal error, close the connection and return the error
    fn fail(&self, mut guard: MutexGuard<'_, ProtocolState>, err: WaylandError) -> WaylandError {
        if guard.closed {
            return WaylandError::ConnectionClosed;
        }
        log::error!("Fatal error on {} connection: {err}", guard.side.name());
        if guard.side == Side::Server {
            guard.post_fatal(&err);
        }
        guard.last_error = Some(err.clone());
        let dead = guard.teardown();
        drop(guard);
        notify_destroyed(dead);
        err
    }

    fn wait_readable(&self) -> Result<(), WaylandError> {
        let fd = self.poll_fd();
        let mut fds = [PollFd::new(&fd, PollFlags::IN | PollFlags::ERR)];
        loop {
            match poll(&mut fds, None) {
                Ok(_) => return Ok(()),
                Err(rustix::io::Errno::INTR) => continue,
                Err(e) => {
                    let guard = self.state.lock_protocol();
                    return Err(self.fail(guard, std::io::Error::from(e).into()));
                }
            }
        }
    }
}

impl AsFd for Connection {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.poll_fd()
    }
}

fn notify_destroyed(dead: Vec<(ObjectId, Arc<dyn ObjectData>)>) {
    for (id, data) in dead {
        data.destroyed(id);
    }
}

impl ProtocolState {
    fn next_serial(&mut self) -> u32 {
        self.last_serial = self.last_serial.wrapping_add(1);
        self.last_serial
    }

    #[inline]
    fn check_open(&self) -> Result<(), WaylandError> {
        if self.closed {
            Err(WaylandError::ConnectionClosed)
        } else {
            Ok(())
        }
    }

    fn get_object(&self, id: &ObjectId) -> Result<Object<Data>, InvalidId> {
        let object = self.map.find(id.id).ok_or(InvalidId)?;
        if object.data.serial != id.serial {
            return Err(InvalidId);
        }
        Ok(object.clone())
    }

    // Write a message built by the connection itself
    fn write_internal(
        &mut self,
        interface: &'static Interface,
        id: u32,
        opcode: u16,
        args: SmallVec<[Argument<u32, RawFd>; INLINE_ARGS]>,
    ) -> Result<(), WaylandError> {
        let desc = self
            .side
            .outgoing(interface)
            .get(opcode as usize)
            .ok_or(EncodingError::UnknownOpcode { interface: interface.name, opcode })?;
        if self.debug {
            debug::print_send_message(interface.name, id, desc.name, &args);
        }
        log::debug!("Sending {}@{}.{} ({})", interface.name, id, desc.name, debug::ArgList(&args));
        let msg = Message { sender_id: id, opcode, args };
        self.socket.write_message(&msg, desc.signature).map_err(|e| match e {
            WriteError::Message(reason) => {
                let message = desc.name;
                EncodingError::Write { interface: interface.name, message, reason }.into()
            }
            WriteError::Io(e) => e.into(),
        })
    }

    // Apply a destructor to an object
    fn destroy_object(&mut self, id: u32) -> Result<(), WaylandError> {
        match self.side {
            Side::Client => {
                // the id stays reserved until the server acknowledges the destruction
                let released = self.map.with(id, |obj| obj.data.peer_released).unwrap_or(false);
                if released {
                    self.map.remove(id);
                } else {
                    self.map.mark_zombie(id);
                }
            }
            Side::Server if id < SERVER_ID_LIMIT => {
                self.map.remove(id);
                self.write_internal(
                    &WL_DISPLAY_INTERFACE,
                    DISPLAY_ID,
                    DISPLAY_DELETE_ID,
                    smallvec![Argument::Uint(id)],
                )?;
            }
            // the client replaces its zombie when the id is announced again
            Side::Server => {
                self.map.remove(id);
            }
        }
        Ok(())
    }

    fn send_display_error(&mut self, object_id: u32, code: u32, message: &str) {
        let message = CString::new(message.replace('\0', "")).unwrap_or_default();
        let ret = self.write_internal(
            &WL_DISPLAY_INTERFACE,
            DISPLAY_ID,
            DISPLAY_ERROR,
            smallvec![
                Argument::Object(object_id),
                Argument::Uint(code),
                Argument::Str(Some(Box::new(message))),
            ],
        );
        if let Err(e) = ret {
            log::warn!("Failed to send protocol error: {e}");
        }
    }

    // Tell the client why the connection is about to be closed
    fn post_fatal(&mut self, err: &WaylandError) {
        let (object_id, code, message) = match *err {
            WaylandError::UnknownObject(_) | WaylandError::InvalidNewId { .. } => {
                (DISPLAY_ID, display_error::INVALID_OBJECT, err.to_string())
            }
            WaylandError::UnknownOpcode { object_id, .. }
            | WaylandError::Malformed { object_id, .. } => {
                let object_id =
                    if self.map.find(object_id).is_some() { object_id } else { DISPLAY_ID };
                (object_id, display_error::INVALID_METHOD, err.to_string())
            }
            WaylandError::Protocol(ref e) => (e.object_id, e.code, e.message.clone()),
            _ => return,
        };
        self.send_display_error(object_id, code, &message);
        if let Err(e) = self.socket.flush() {
            log::warn!("Failed to flush the protocol error: {e}");
        }
    }

    // Close the socket and drain the map, returning the objects that were still alive
    fn teardown(&mut self) -> Vec<(ObjectId, Arc<dyn ObjectData>)> {
        self.closed = true;
        self.socket.socket().shutdown();
        self.map
            .clear()
            .into_iter()
            .filter(|(_, obj)| !obj.is_zombie())
            .map(|(id, obj)| {
                let id = ObjectId { id, serial: obj.data.serial, interface: obj.interface };
                (id, obj.data.user_data)
            })
            .collect()
    }
}

// Exclusive right to read from the socket
struct ReaderSlot {
    state: Arc<ConnectionState>,
}

impl ReaderSlot {
    fn acquire(state: &Arc<ConnectionState>) -> Result<Self, WaylandError> {
        Self::acquire_waiting(state).map(|(slot, _)| slot)
    }

    // also returns whether another thread was reading in the meantime
    fn acquire_waiting(state: &Arc<ConnectionState>) -> Result<(Self, bool), WaylandError> {
        let me = thread::current().id();
        let mut guard = state.lock_read();
        if guard.reader == Some(me) {
            return Err(WaylandError::Reentrant);
        }
        let serial = guard.read_serial;
        guard = state.read_condvar.wait_while(guard, |reading| reading.reader.is_some()).unwrap();
        guard.reader = Some(me);
        let waited = guard.read_serial != serial;
        Ok((Self { state: state.clone() }, waited))
    }
}

impl Drop for ReaderSlot {
    fn drop(&mut self) {
        let mut guard = self.state.lock_read();
        guard.reader = None;
        guard.read_serial = guard.read_serial.wrapping_add(1);
        self.state.read_condvar.notify_all();
    }
}

/// Object data that ignores every message
#[derive(Debug)]
pub struct DumbObjectData;

impl ObjectData for DumbObjectData {
    fn dispatch(
        self: Arc<Self>,
        _conn: &Connection,
        _msg: Message<ObjectId, OwnedFd>,
    ) -> Option<Arc<dyn ObjectData>> {
        None
    }
}

// placeholder of objects created by the peer until their handler is known
#[derive(Debug)]
struct UninitObjectData;

impl ObjectData for UninitObjectData {
    fn dispatch(
        self: Arc<Self>,
        _conn: &Connection,
        msg: Message<ObjectId, OwnedFd>,
    ) -> Option<Arc<dyn ObjectData>> {
        log::warn!(
            "Dropping message {} on {}: the object has no handler",
            msg.opcode,
            msg.sender_id
        );
        None
    }
}

// the callback of a roundtrip
#[derive(Debug, Default)]
struct SyncData {
    done: AtomicBool,
}

impl ObjectData for SyncData {
    fn dispatch(
        self: Arc<Self>,
        _conn: &Connection,
        _msg: Message<ObjectId, OwnedFd>,
    ) -> Option<Arc<dyn ObjectData>> {
        self.done.store(true, Ordering::Release);
        None
    }
}
