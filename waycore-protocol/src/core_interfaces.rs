//! Core interfaces of the protocol
//!
//! This module contains hard-coded tables for `wl_display`,
//! `wl_registry` and `wl_callback`. These interfaces are frozen in the
//! protocol and can never change. They are the only interfaces the
//! server core needs to be aware of in particular; everything else
//! comes out of the protocol compiler.

use crate::protocol::{Interface, MessageDesc};

static TYPES_NULL: [Option<&'static Interface>; 4] = [None; 4];

/// Interface `wl_display`
pub static WL_DISPLAY_INTERFACE: Interface = Interface {
    name: "wl_display",
    version: 1,
    requests: &[
        MessageDesc {
            name: "sync",
            signature: "n",
            types: &[Some(&WL_CALLBACK_INTERFACE)],
            is_destructor: false,
        },
        MessageDesc {
            name: "get_registry",
            signature: "n",
            types: &[Some(&WL_REGISTRY_INTERFACE)],
            is_destructor: false,
        },
    ],
    events: &[
        MessageDesc {
            name: "error",
            signature: "ous",
            types: &TYPES_NULL,
            is_destructor: false,
        },
        MessageDesc {
            name: "delete_id",
            signature: "u",
            types: &TYPES_NULL,
            is_destructor: false,
        },
    ],
};

/// Interface `wl_registry`
pub static WL_REGISTRY_INTERFACE: Interface = Interface {
    name: "wl_registry",
    version: 1,
    requests: &[MessageDesc {
        name: "bind",
        signature: "usun",
        types: &TYPES_NULL,
        is_destructor: false,
    }],
    events: &[
        MessageDesc {
            name: "global",
            signature: "usu",
            types: &TYPES_NULL,
            is_destructor: false,
        },
        MessageDesc {
            name: "global_remove",
            signature: "u",
            types: &TYPES_NULL,
            is_destructor: false,
        },
    ],
};

/// Interface `wl_callback`
pub static WL_CALLBACK_INTERFACE: Interface = Interface {
    name: "wl_callback",
    version: 1,
    requests: &[],
    events: &[MessageDesc {
        name: "done",
        signature: "u",
        types: &TYPES_NULL,
        is_destructor: true,
    }],
};

/// Opcodes of the display requests and events used by the server core.
pub mod wl_display {
    pub const REQ_SYNC: u16 = 0;
    pub const REQ_GET_REGISTRY: u16 = 1;
    pub const EVT_ERROR: u16 = 0;
    pub const EVT_DELETE_ID: u16 = 1;
}

/// Opcodes of the registry requests and events used by the server core.
pub mod wl_registry {
    pub const REQ_BIND: u16 = 0;
    pub const EVT_GLOBAL: u16 = 0;
    pub const EVT_GLOBAL_REMOVE: u16 = 1;
}

/// Opcodes of the callback events used by the server core.
pub mod wl_callback {
    pub const EVT_DONE: u16 = 0;
}
