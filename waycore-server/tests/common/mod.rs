//! Shared fixtures: a wire-level test client and a small test
//! interface with its global.
#![allow(dead_code)]

use std::collections::HashMap;
use std::os::unix::io::{OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex};

use waycore_protocol::core_interfaces::WL_DISPLAY_INTERFACE;
use waycore_protocol::protocol::{Argument, Interface, Message, MessageDesc};
use waycore_protocol::socket::{BufferedSocket, Socket};
use waycore_protocol::wire::MessageParseError;
use waycore_server::{
    ClientData, ClientId, Display, GlobalHandler, GlobalId, Handle, ObjectData, ObjectId,
};

/// A test interface: a quad that can be spun, retitled, attached to a
/// peer and split into a new quad.
pub static WC_QUAD_INTERFACE: Interface = Interface {
    name: "wc_quad",
    version: 3,
    requests: &[
        MessageDesc { name: "destroy", signature: "", types: &[], is_destructor: true },
        MessageDesc { name: "set_title", signature: "s", types: &[None], is_destructor: false },
        MessageDesc { name: "spin", signature: "2u", types: &[None], is_destructor: false },
        MessageDesc {
            name: "attach",
            signature: "?o",
            types: &[Some(&WC_QUAD_INTERFACE)],
            is_destructor: false,
        },
        MessageDesc {
            name: "split",
            signature: "n",
            types: &[Some(&WC_QUAD_INTERFACE)],
            is_destructor: false,
        },
    ],
    events: &[MessageDesc { name: "ping", signature: "u", types: &[None], is_destructor: false }],
};

pub const REQ_DESTROY: u16 = 0;
pub const REQ_SET_TITLE: u16 = 1;
pub const REQ_SPIN: u16 = 2;
pub const REQ_ATTACH: u16 = 3;
pub const REQ_SPLIT: u16 = 4;

/// Object data recording every request and destruction into a shared
/// log.
pub struct QuadData {
    pub log: Arc<Mutex<Vec<String>>>,
}

impl ObjectData<()> for QuadData {
    fn request(
        self: Arc<Self>,
        _handle: &Handle<()>,
        _data: &mut (),
        _client_id: ClientId,
        msg: Message<ObjectId, OwnedFd>,
    ) -> Option<Arc<dyn ObjectData<()>>> {
        let desc = &WC_QUAD_INTERFACE.requests[msg.opcode as usize];
        self.log
            .lock()
            .unwrap()
            .push(format!("{}@{}", desc.name, msg.sender_id.protocol_id()));
        if desc.name == "split" {
            Some(Arc::new(QuadData { log: self.log.clone() }))
        } else {
            None
        }
    }

    fn destroyed(
        self: Arc<Self>,
        _handle: &Handle<()>,
        _data: &mut (),
        _client_id: ClientId,
        object_id: ObjectId,
    ) {
        self.log.lock().unwrap().push(format!("destroyed@{}", object_id.protocol_id()));
    }
}

/// Global handler constructing [`QuadData`] resources.
pub struct QuadGlobal {
    pub log: Arc<Mutex<Vec<String>>>,
}

impl GlobalHandler<()> for QuadGlobal {
    fn bind(
        self: Arc<Self>,
        _handle: &Handle<()>,
        _data: &mut (),
        _client_id: ClientId,
        global_id: GlobalId,
        object_id: ObjectId,
    ) -> Arc<dyn ObjectData<()>> {
        self.log
            .lock()
            .unwrap()
            .push(format!("bind:{}@{}", global_id.name(), object_id.protocol_id()));
        Arc::new(QuadData { log: self.log.clone() })
    }
}

/// Client-lifecycle data recording disconnections.
pub struct TrackClientData {
    pub log: Arc<Mutex<Vec<String>>>,
}

impl ClientData for TrackClientData {
    fn disconnected(&self, _client_id: ClientId, reason: waycore_server::DisconnectReason) {
        self.log.lock().unwrap().push(format!("disconnected:{:?}", reason));
    }
}

/// The client end of a connection, driven directly at the wire level.
pub struct WireClient {
    socket: BufferedSocket,
    objects: HashMap<u32, &'static Interface>,
}

impl WireClient {
    pub fn new(stream: UnixStream) -> WireClient {
        let mut objects = HashMap::new();
        objects.insert(1, &WL_DISPLAY_INTERFACE);
        WireClient { socket: BufferedSocket::new(Socket::from(stream)), objects }
    }

    /// Teach the client which interface lives at an id, so that
    /// incoming events can be decoded.
    pub fn register(&mut self, id: u32, interface: &'static Interface) {
        self.objects.insert(id, interface);
    }

    /// Queue and flush one request.
    pub fn send(&mut self, msg: Message<u32, RawFd>, signature: &str) {
        self.socket.write_message(&msg, signature).unwrap();
        self.socket.flush().unwrap();
    }

    /// Receive the next event, if any is pending.
    pub fn recv_event(&mut self) -> Option<Message<u32, OwnedFd>> {
        loop {
            let objects = &self.objects;
            let parsed = self.socket.read_one_message(|id, opcode| {
                objects
                    .get(&id)
                    .and_then(|interface| interface.events.get(opcode as usize))
                    .map(|desc| desc.signature)
            });
            match parsed {
                Ok(msg) => return Some(msg),
                Err(MessageParseError::Malformed) => panic!("received an undecodable event"),
                Err(_) => match self.socket.fill_incoming_buffers() {
                    Ok(()) => continue,
                    Err(_) => return None,
                },
            }
        }
    }

    /// Drain all pending events.
    pub fn recv_all(&mut self) -> Vec<Message<u32, OwnedFd>> {
        let mut events = Vec::new();
        while let Some(msg) = self.recv_event() {
            events.push(msg);
        }
        events
    }

    /// Assert that the server has hung up on us.
    pub fn assert_closed(&mut self) {
        loop {
            match self.socket.fill_incoming_buffers() {
                Ok(()) => continue,
                Err(e) if e.raw_os_error() == Some(nix::errno::Errno::EPIPE as i32) => return,
                Err(e) => panic!("expected EOF, got {:?}", e),
            }
        }
    }
}

/// A display connected to one wire-level client.
pub fn display_pair() -> (Display<()>, ClientId, WireClient, Arc<Mutex<Vec<String>>>) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let (client_stream, server_stream) = UnixStream::pair().unwrap();
    let display: Display<()> = Display::new();
    let client_id = display
        .insert_client(server_stream, Arc::new(TrackClientData { log: log.clone() }))
        .unwrap();
    (display, client_id, WireClient::new(client_stream), log)
}

/// Find the string payload of a `wl_display.error` event and return
/// `(code, message)`.
pub fn as_display_error(msg: &Message<u32, OwnedFd>) -> Option<(u32, String)> {
    if msg.sender_id != 1 || msg.opcode != 0 {
        return None;
    }
    match (&msg.args[1], &msg.args[2]) {
        (Argument::Uint(code), Argument::Str(Some(text))) => {
            Some((*code, text.to_string_lossy().into_owned()))
        }
        _ => None,
    }
}
