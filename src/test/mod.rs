#![allow(dead_code)]

use std::{
    ffi::CString,
    os::unix::{
        io::{OwnedFd, RawFd},
        net::UnixStream,
    },
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use crate::{
    connection::{Config, Connection, DumbObjectData, ObjectData, ObjectId, OpcodeHandlers},
    core_interfaces::DISPLAY_GET_REGISTRY,
    protocol::{
        AllowNull, Argument, ArgumentType, Interface, Message, MessageDesc, ANONYMOUS_INTERFACE,
    },
};


/*
 * Interfaces used by the tests
 */

pub(crate) const SET_VALUE: u16 = 0;
pub(crate) const NOTE: u16 = 1;
pub(crate) const LINK: u16 = 2;
pub(crate) const SHARE_FD: u16 = 3;
pub(crate) const NEWER: u16 = 4;
pub(crate) const DESTROY: u16 = 5;

pub(crate) const EVT_VALUE: u16 = 0;
pub(crate) const EVT_CYCLE_QUAD: u16 = 1;

pub(crate) const QUAD_DESTROY: u16 = 0;
pub(crate) const QUAD_PING: u16 = 0;
pub(crate) const QUAD_GONE: u16 = 1;

pub(crate) static TEST_GLOBAL_INTERFACE: Interface = Interface {
    name: "test_global",
    version: 3,
    requests: &[
        MessageDesc {
            name: "set_value",
            signature: &[ArgumentType::Uint],
            since: 1,
            is_destructor: false,
            child_interface: None,
            arg_interfaces: &[],
        },
        MessageDesc {
            name: "note",
            signature: &[
                ArgumentType::Uint,
                ArgumentType::Str(AllowNull::Yes),
                ArgumentType::Array,
            ],
            since: 1,
            is_destructor: false,
            child_interface: None,
            arg_interfaces: &[],
        },
        MessageDesc {
            name: "link",
            signature: &[
                ArgumentType::Uint,
                ArgumentType::Fixed,
                ArgumentType::Object(AllowNull::Yes),
                ArgumentType::NewId,
            ],
            since: 1,
            is_destructor: false,
            child_interface: Some(&QUAD_INTERFACE),
            arg_interfaces: &[&ANONYMOUS_INTERFACE],
        },
        MessageDesc {
            name: "share_fd",
            signature: &[ArgumentType::Fd, ArgumentType::Uint],
            since: 1,
            is_destructor: false,
            child_interface: None,
            arg_interfaces: &[],
        },
        MessageDesc {
            name: "newer",
            signature: &[],
            since: 2,
            is_destructor: false,
            child_interface: None,
            arg_interfaces: &[],
        },
        MessageDesc {
            name: "destroy",
            signature: &[],
            since: 1,
            is_destructor: true,
            child_interface: None,
            arg_interfaces: &[],
        },
    ],
    events: &[
        MessageDesc {
            name: "value",
            signature: &[ArgumentType::Uint],
            since: 1,
            is_destructor: false,
            child_interface: None,
            arg_interfaces: &[],
        },
        MessageDesc {
            name: "cycle_quad",
            signature: &[ArgumentType::NewId, ArgumentType::Object(AllowNull::Yes)],
            since: 1,
            is_destructor: false,
            child_interface: Some(&QUAD_INTERFACE),
            arg_interfaces: &[&QUAD_INTERFACE],
        },
    ],
};

pub(crate) static QUAD_INTERFACE: Interface = Interface {
    name: "quad",
    version: 3,
    requests: &[MessageDesc {
        name: "destroy",
        signature: &[],
        since: 1,
        is_destructor: true,
        child_interface: None,
        arg_interfaces: &[],
    }],
    events: &[
        MessageDesc {
            name: "ping",
            signature: &[ArgumentType::Uint],
            since: 1,
            is_destructor: false,
            child_interface: None,
            arg_interfaces: &[],
        },
        MessageDesc {
            name: "gone",
            signature: &[],
            since: 1,
            is_destructor: true,
            child_interface: None,
            arg_interfaces: &[],
        },
    ],
};

/*
 * Helpers
 */

pub(crate) fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A client and a server connected through a socket pair
///
/// The server binds the test global with `global_data` and records the server side ids
/// of the bound globals.
pub(crate) struct Setup {
    pub(crate) client: Connection,
    pub(crate) server: Connection,
    bound: Arc<Mutex<Vec<ObjectId>>>,
    registry: Mutex<Option<ObjectId>>,
}

pub(crate) fn setup(global_data: Arc<dyn ObjectData>) -> Setup {
    init_log();
    let bound = Arc::new(Mutex::new(Vec::new()));
    let (client_socket, server_socket) = UnixStream::pair().unwrap();
    let client = Connection::new(client_socket, Config::client(), Arc::new(DumbObjectData));
    let server = Connection::new(
        server_socket,
        Config::server().with_interfaces([&TEST_GLOBAL_INTERFACE, &QUAD_INTERFACE]),
        serving_display(global_data, bound.clone()),
    );
    Setup { client, server, bound, registry: Mutex::new(None) }
}

// Display data of a server whose registry binds the test global
fn serving_display(
    global_data: Arc<dyn ObjectData>,
    bound: Arc<Mutex<Vec<ObjectId>>>,
) -> Arc<dyn ObjectData> {
    Arc::new(OpcodeHandlers::new().on(DISPLAY_GET_REGISTRY, move |_, _| {
        let global_data = global_data.clone();
        let bound = bound.clone();
        Some(Arc::new(OpcodeHandlers::new().on(0, move |_, msg| {
            if let Some(Argument::NewId(id)) = msg.args.last() {
                bound.lock().unwrap().push(id.clone());
            }
            Some(global_data.clone())
        })))
    }))
}

impl Setup {
    /// Bind the test global from the client and let the server process it
    ///
    /// Returns the id of the global on the client and on the server.
    pub(crate) fn bind(&self, data: Arc<dyn ObjectData>) -> (ObjectId, ObjectId) {
        let client = &self.client;
        let registry: ObjectId = client
            .send_request(
                message!(
                    client.display_id(),
                    DISPLAY_GET_REGISTRY,
                    [Argument::NewId(ObjectId::null())]
                ),
                Some(Arc::new(DumbObjectData)),
                None,
            )
            .unwrap();
        let global = client
            .send_request(
                message!(
                    registry.clone(),
                    0,
                    [
                        Argument::Uint(1),
                        Argument::Str(Some(Box::new(CString::new("test_global").unwrap()))),
                        Argument::Uint(3),
                        Argument::NewId(ObjectId::null()),
                    ]
                ),
                Some(data),
                Some((&TEST_GLOBAL_INTERFACE, 3)),
            )
            .unwrap();
        *self.registry.lock().unwrap() = Some(registry);
        client.flush().unwrap();
        assert_eq!(self.server.dispatch_pending().unwrap(), 2);
        let server_global = self.bound.lock().unwrap().last().cloned().unwrap();
        assert_eq!(server_global.protocol_id(), global.protocol_id());
        (global, server_global)
    }

    /// The client side registry created by the last [`bind()`](Self::bind)
    pub(crate) fn registry(&self) -> ObjectId {
        self.registry.lock().unwrap().clone().unwrap()
    }

    /// Flush the client, then dispatch on the server
    pub(crate) fn to_server(&self) -> usize {
        self.client.flush().unwrap();
        self.server.dispatch_pending().unwrap()
    }

    /// Flush the server, then dispatch on the client
    pub(crate) fn to_client(&self) -> usize {
        self.server.flush().unwrap();
        self.client.dispatch_pending().unwrap()
    }
}

/// Encode a message the way a peer would, bypassing every check of the connection
pub(crate) fn raw_message(
    sender_id: u32,
    opcode: u16,
    args: smallvec::SmallVec<[Argument<u32, RawFd>; crate::protocol::INLINE_ARGS]>,
) -> Vec<u8> {
    let signature = args.iter().map(Argument::arg_type).collect::<Vec<_>>();
    let msg = Message { sender_id, opcode, args };
    let (bytes, _) = crate::wire::encode_message(&msg, &signature).unwrap();
    bytes
}

/// Object data keeping every message it receives
///
/// Objects created by these messages get their own recorder.
#[derive(Debug, Default)]
pub(crate) struct Recorder {
    pub(crate) received: Mutex<Vec<Message<ObjectId, OwnedFd>>>,
    pub(crate) destroyed: AtomicBool,
}

impl Recorder {
    pub(crate) fn opcodes(&self) -> Vec<u16> {
        self.received.lock().unwrap().iter().map(|msg| msg.opcode).collect()
    }

    pub(crate) fn take(&self) -> Vec<Message<ObjectId, OwnedFd>> {
        std::mem::take(&mut *self.received.lock().unwrap())
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// The objects created by the messages received so far
    pub(crate) fn created(&self) -> Vec<ObjectId> {
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
