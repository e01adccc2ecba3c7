// Interface tables of the data transfer objects, written the way a generator emits them

use wayland_wire::protocol::{AllowNull, ArgumentType, Interface, MessageDesc};

pub const MANAGER_CREATE_DATA_SOURCE: u16 = 0;
pub const MANAGER_GET_DATA_DEVICE: u16 = 1;
pub const MANAGER_CREATE_SURFACE: u16 = 2;

pub const SOURCE_OFFER: u16 = 0;
pub const SOURCE_DESTROY: u16 = 1;
pub const SOURCE_EVT_SEND: u16 = 0;
pub const SOURCE_EVT_CANCELLED: u16 = 1;

pub const OFFER_ACCEPT: u16 = 0;
pub const OFFER_RECEIVE: u16 = 1;
pub const OFFER_DESTROY: u16 = 2;
pub const OFFER_EVT_OFFER: u16 = 0;

pub const DEVICE_START_DRAG: u16 = 0;
pub const DEVICE_SET_SELECTION: u16 = 1;
pub const DEVICE_RELEASE: u16 = 2;
pub const DEVICE_EVT_DATA_OFFER: u16 = 0;
pub const DEVICE_EVT_ENTER: u16 = 1;
pub const DEVICE_EVT_LEAVE: u16 = 2;
pub const DEVICE_EVT_MOTION: u16 = 3;
pub const DEVICE_EVT_DROP: u16 = 4;
pub const DEVICE_EVT_SELECTION: u16 = 5;

pub const SURFACE_DESTROY: u16 = 0;

pub static TEST_MANAGER_INTERFACE: Interface = Interface {
    name: "test_manager",
    version: 3,
    requests: &[
        MessageDesc {
            name: "create_data_source",
            signature: &[ArgumentType::NewId],
            since: 1,
            is_destructor: false,
            child_interface: Some(&WL_DATA_SOURCE_INTERFACE),
            arg_interfaces: &[],
        },
        MessageDesc {
            name: "get_data_device",
            signature: &[ArgumentType::NewId],
            since: 1,
            is_destructor: false,
            child_interface: Some(&WL_DATA_DEVICE_INTERFACE),
            arg_interfaces: &[],
        },
        MessageDesc {
            name: "create_surface",
            signature: &[ArgumentType::NewId],
            since: 1,
            is_destructor: false,
            child_interface: Some(&WL_SURFACE_INTERFACE),
            arg_interfaces: &[],
        },
    ],
    events: &[],
};

pub static WL_DATA_SOURCE_INTERFACE: Interface = Interface {
    name: "wl_data_source",
    version: 3,
    requests: &[
        MessageDesc {
            name: "offer",
            signature: &[ArgumentType::Str(AllowNull::No)],
            since: 1,
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
            name: "send",
            signature: &[ArgumentType::Str(AllowNull::No), ArgumentType::Fd],
            since: 1,
            is_destructor: false,
            child_interface: None,
            arg_interfaces: &[],
        },
        MessageDesc {
            name: "cancelled",
            signature: &[],
            since: 1,
            is_destructor: false,
            child_interface: None,
            arg_interfaces: &[],
        },
    ],
};

pub static WL_DATA_OFFER_INTERFACE: Interface = Interface {
    name: "wl_data_offer",
    version: 3,
    requests: &[
        MessageDesc {
            name: "accept",
            signature: &[ArgumentType::Uint, ArgumentType::Str(AllowNull::Yes)],
            since: 1,
            is_destructor: false,
            child_interface: None,
            arg_interfaces: &[],
        },
        MessageDesc {
            name: "receive",
            signature: &[ArgumentType::Str(AllowNull::No), ArgumentType::Fd],
            since: 1,
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
    events: &[MessageDesc {
        name: "offer",
        signature: &[ArgumentType::Str(AllowNull::No)],
        since: 1,
        is_destructor: false,
        child_interface: None,
        arg_interfaces: &[],
    }],
};

pub static WL_DATA_DEVICE_INTERFACE: Interface = Interface {
    name: "wl_data_device",
    version: 3,
    requests: &[
        MessageDesc {
            name: "start_drag",
            signature: &[
                ArgumentType::Object(AllowNull::Yes),
                ArgumentType::Object(AllowNull::No),
                ArgumentType::Object(AllowNull::Yes),
                ArgumentType::Uint,
            ],
            since: 1,
            is_destructor: false,
            child_interface: None,
            arg_interfaces: &[
                &WL_DATA_SOURCE_INTERFACE,
                &WL_SURFACE_INTERFACE,
                &WL_SURFACE_INTERFACE,
            ],
        },
        MessageDesc {
            name: "set_selection",
            signature: &[ArgumentType::Object(AllowNull::Yes), ArgumentType::Uint],
            since: 1,
            is_destructor: false,
            child_interface: None,
            arg_interfaces: &[&WL_DATA_SOURCE_INTERFACE],
        },
        MessageDesc {
            name: "release",
            signature: &[],
            since: 2,
            is_destructor: true,
            child_interface: None,
            arg_interfaces: &[],
        },
    ],
    events: &[
        MessageDesc {
            name: "data_offer",
            signature: &[ArgumentType::NewId],
            since: 1,
            is_destructor: false,
            child_interface: Some(&WL_DATA_OFFER_INTERFACE),
            arg_interfaces: &[],
        },
        MessageDesc {
            name: "enter",
            signature: &[
                ArgumentType::Uint,
                ArgumentType::Object(AllowNull::No),
                ArgumentType::Fixed,
                ArgumentType::Fixed,
                ArgumentType::Object(AllowNull::Yes),
            ],
            since: 1,
            is_destructor: false,
            child_interface: None,
            arg_interfaces: &[&WL_SURFACE_INTERFACE, &WL_DATA_OFFER_INTERFACE],
        },
        MessageDesc {
            name: "leave",
            signature: &[],
            since: 1,
            is_destructor: false,
            child_interface: None,
            arg_interfaces: &[],
        },
        MessageDesc {
            name: "motion",
            signature: &[ArgumentType::Uint, ArgumentType::Fixed, ArgumentType::Fixed],
            since: 1,
            is_destructor: false,
            child_interface: None,
            arg_interfaces: &[],
        },
        MessageDesc {
            name: "drop",
            signature: &[],
            since: 1,
            is_destructor: false,
            child_interface: None,
            arg_interfaces: &[],
        },
        MessageDesc {
            name: "selection",
            signature: &[ArgumentType::Object(AllowNull::Yes)],
            since: 1,
            is_destructor: false,
            child_interface: None,
            arg_interfaces: &[&WL_DATA_OFFER_INTERFACE],
        },
    ],
};

pub static WL_SURFACE_INTERFACE: Interface = Interface {
    name: "wl_surface",
    version: 3,
    requests: &[MessageDesc {
        name: "destroy",
        signature: &[],
        since: 1,
        is_destructor: true,
        child_interface: None,
        arg_interfaces: &[],
    }],
    events: &[],
};
