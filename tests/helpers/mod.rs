// This module contains helpers functions and types that
// are not test in themselves, but are used by several tests.

#![allow(dead_code)]

pub mod interfaces;

use std::ffi::CString;
use std::os::unix::io::OwnedFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use wayland_wire::core_interfaces::DISPLAY_GET_REGISTRY;
use wayland_wire::protocol::{Argument, Message};
use wayland_wire::{message, Config, Connection, ObjectData, ObjectId, OpcodeHandlers};

use self::interfaces::*;

pub fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A client and a server talking over a socket pair
///
/// The server exposes the data transfer manager as the only global of its registry.
pub struct TestPair {
    pub client: Connection,
    pub server: Connection,
    /// Object data of every manager bound on the server
    pub server_manager: Arc<Recorder>,
}

impl TestPair {
    pub fn new() -> TestPair {
        init_log();
        let (client_socket, server_socket) = UnixStream::pair().unwrap();
        let server_manager = Arc::new(Recorder::default());
        let manager_data = server_manager.clone();
        let display_data = OpcodeHandlers::new().on(DISPLAY_GET_REGISTRY, move |_, _| {
            let manager_data = manager_data.clone();
            // wl_registry.bind hands out the manager whatever the requested name
            Some(Arc::new(OpcodeHandlers::new().on(0, move |_, _| Some(manager_data.clone()))))
        });
        let server = Connection::new(
            server_socket,
            Config::server().with_interfaces([&TEST_MANAGER_INTERFACE]),
            Arc::new(display_data),
        );
        let client = Connection::connect(client_socket);
        TestPair { client, server, server_manager }
    }

    /// Bind the manager from the client
    pub fn bind_manager(&self, version: u32) -> ObjectId {
        let registry = self
            .client
            .send_request(
                message!(
                    self.client.display_id(),
                    DISPLAY_GET_REGISTRY,
                    [Argument::NewId(ObjectId::null())]
                ),
                Some(Arc::new(Recorder::default())),
                None,
            )
            .unwrap();
        self.client
            .send_request(
                message!(
                    registry,
                    0,
                    [
                        Argument::Uint(1),
                        Argument::Str(Some(Box::new(
                            CString::new(TEST_MANAGER_INTERFACE.name).unwrap(),
                        ))),
                        Argument::Uint(version),
                        Argument::NewId(ObjectId::null()),
                    ]
                ),
                Some(Arc::new(Recorder::default())),
                Some((&TEST_MANAGER_INTERFACE, version)),
            )
            .unwrap()
    }

    /// Create a child of the client manager, through one of its constructor requests
    pub fn create(&self, manager: &ObjectId, opcode: u16, data: Arc<dyn ObjectData>) -> ObjectId {
        let msg = message!(manager.clone(), opcode, [Argument::NewId(ObjectId::null())]);
        self.client.send_request(msg, Some(data), None).unwrap()
    }

    /// Flush the client, then dispatch on the server
    pub fn to_server(&self) -> usize {
        self.client.flush().unwrap();
        self.server.dispatch_pending().unwrap()
    }

    /// Flush the server, then dispatch on the client
    pub fn to_client(&self) -> usize {
        self.server.flush().unwrap();
        self.client.dispatch_pending().unwrap()
    }
}

/// Object data keeping every message it receives
///
/// Objects created by these messages get their own recorder.
#[derive(Debug, Default)]
pub struct Recorder {
    pub received: Mutex<Vec<Message<ObjectId, OwnedFd>>>,
    destroyed: AtomicBool,
}

impl Recorder {
    pub fn opcodes(&self) -> Vec<u16> {
        self.received.lock().unwrap().iter().map(|msg| msg.opcode).collect()
    }

    pub fn take(&self) -> Vec<Message<ObjectId, OwnedFd>> {
        std::mem::take(&mut *self.received.lock().unwrap())
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// The objects created by the messages received so far
    pub fn created(&self) -> Vec<ObjectId> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .flat_map(|msg| msg.args.iter())
            .filter_map(|arg| match arg {
                Argument::NewId(id) => Some(id.clone()),
                _ => None,
            })
            .collect()
    }
}

impl ObjectData for Recorder {
    fn dispatch(
        self: Arc<Self>,
        _conn: &Connection,
        msg: Message<ObjectId, OwnedFd>,
    ) -> Option<Arc<dyn ObjectData>> {
        let creates = msg.args.iter().any(|arg| matches!(arg, Argument::NewId(_)));
        self.received.lock().unwrap().push(msg);
        if creates {
            Some(Arc::new(Recorder::default()))
        } else {
            None
        }
    }

    fn destroyed(&self, _object_id: ObjectId) {
        self.destroyed.store(true, Ordering::SeqCst);
    }
}

/// The recorder attached to an object
pub fn recorder_of(conn: &Connection, id: &ObjectId) -> Arc<Recorder> {
    conn.get_data(id).unwrap().downcast_arc::<Recorder>().unwrap()
}

pub fn string(value: &str) -> Argument<ObjectId, std::os::unix::io::RawFd> {
    Argument::Str(Some(Box::new(CString::new(value).unwrap())))
}
