//! Server-side dispatch core for the Wayland protocol.
//!
//! A [`Display`] owns the shared server state: the client store, the
//! advertised globals and the registry fan-out, the event serial
//! counter. Each client carries its own buffered connection and object
//! map; requests are routed to [`ObjectData`] trampolines (or, for
//! legacy objects, to a per-interface [`RequestVtable`]), and events
//! are queued on the client's write buffer without ever blocking.
//!
//! The crate does not run an event loop of its own: the embedding
//! application watches the listening sockets and client connections
//! for readiness and calls back into [`Display::dispatch_client`] /
//! [`Display::flush_clients`] with the observed [`Readiness`] mask.
//!
//! ```no_run
//! use std::sync::Arc;
//! use waycore_server::{Display, ListeningSocket};
//!
//! let display: Display<()> = Display::new();
//! let socket = ListeningSocket::bind_auto().unwrap();
//! loop {
//!     // reactor integration elided: poll socket and client fds here
//!     if let Some(stream) = socket.accept().unwrap() {
//!         display.insert_client(stream, Arc::new(())).ok();
//!     }
//!     display.dispatch_all_clients(&mut ()).ok();
//!     display.flush_clients().ok();
//! }
//! ```

use std::fmt;
use std::os::unix::io::OwnedFd;
use std::sync::Arc;

use waycore_protocol::protocol::{same_interface, Interface, Message, ANONYMOUS_INTERFACE};

mod client;
mod display;
mod handle;
pub mod map;
mod registry;
mod socket;
mod types;

pub use display::Display;
pub use handle::{Handle, WeakHandle};
pub use map::{ObjectFlags, SERVER_ID_LIMIT};
pub use socket::{ListeningSocket, SocketError};
pub use types::{Credentials, DisconnectReason, GlobalInfo, InvalidId, Readiness, SendError};

/// An id of an object bound to a client.
#[derive(Clone)]
pub struct ObjectId {
    pub(crate) id: u32,
    pub(crate) serial: u32,
    pub(crate) client_id: ClientId,
    pub(crate) interface: &'static Interface,
}

impl ObjectId {
    /// Whether this is the null object id.
    pub fn is_null(&self) -> bool {
        self.id == 0
    }

    /// The interface of this object.
    pub fn interface(&self) -> &'static Interface {
        self.interface
    }

    /// The protocol-level id, as it travels on the wire.
    pub fn protocol_id(&self) -> u32 {
        self.id
    }

    /// Whether both objects belong to the same client.
    pub fn same_client_as(&self, other: &Self) -> bool {
        self.client_id == other.client_id
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}[{}]", self.interface.name, self.id, self.client_id.id)
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({}, {})", self, self.serial)
    }
}

impl PartialEq for ObjectId {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.serial == other.serial
            && self.client_id == other.client_id
            && same_interface(self.interface, other.interface)
    }
}

impl Eq for ObjectId {}

impl std::hash::Hash for ObjectId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
        self.serial.hash(state);
        self.client_id.hash(state);
    }
}

/// An id of a client connected to the server.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ClientId {
    pub(crate) id: u32,
    pub(crate) serial: u32,
}

/// The id of a global.
///
/// This is the `name` advertised through `wl_registry.global`; names
/// are assigned from a display-wide counter and are never re-used.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GlobalId {
    pub(crate) name: u32,
}

impl GlobalId {
    /// The protocol-level name of the global.
    pub fn name(self) -> u32 {
        self.name
    }
}

/// Handler of requests addressed to an object.
///
/// This is the per-object dispatcher: every live object carries an
/// `Arc` of one, and all requests land in [`ObjectData::request`].
pub trait ObjectData<D>: Send + Sync + 'static {
    /// A request was dispatched to the associated object.
    ///
    /// If the request created a new object, the method must return the
    /// [`ObjectData`] for it (returning `None` is a protocol-handling
    /// bug, unless the client was killed while handling the request).
    fn request(
        self: Arc<Self>,
        handle: &Handle<D>,
        data: &mut D,
        client_id: ClientId,
        msg: Message<ObjectId, OwnedFd>,
    ) -> Option<Arc<dyn ObjectData<D>>>;

    /// The object has been destroyed and is no longer reachable.
    fn destroyed(
        self: Arc<Self>,
        handle: &Handle<D>,
        data: &mut D,
        client_id: ClientId,
        object_id: ObjectId,
    ) {
        let _ = (handle, data, client_id, object_id);
    }
}

/// Handler of the lifecycle of a client.
pub trait ClientData: Send + Sync + 'static {
    /// The client was initialized.
    fn initialized(&self, client_id: ClientId) {
        let _ = client_id;
    }

    /// The client is disconnected; pending work for it has been
    /// discarded.
    fn disconnected(&self, client_id: ClientId, reason: DisconnectReason) {
        let _ = (client_id, reason);
    }
}

impl ClientData for () {}

/// Handler of a global advertised through the registry.
pub trait GlobalHandler<D>: Send + Sync + 'static {
    /// Whether the global should be advertised to this client.
    fn can_view(&self, client_id: ClientId, global_id: GlobalId) -> bool {
        let _ = (client_id, global_id);
        true
    }

    /// A client bound the global; the handler must finish constructing
    /// the resource created at `object_id` by returning its data.
    fn bind(
        self: Arc<Self>,
        handle: &Handle<D>,
        data: &mut D,
        client_id: ClientId,
        global_id: GlobalId,
        object_id: ObjectId,
    ) -> Arc<dyn ObjectData<D>>;
}

/// Handler for one request opcode in a legacy vtable.
pub type RequestHandler<D> = fn(
    handle: &Handle<D>,
    data: &mut D,
    client_id: ClientId,
    msg: Message<ObjectId, OwnedFd>,
) -> Option<Arc<dyn ObjectData<D>>>;

/// A per-interface table of request handlers, the compatibility path
/// for objects predating the per-object dispatcher.
///
/// Objects using it are inserted with [`ObjectFlags::LEGACY`], which
/// also exempts them from the since-version check at dispatch time.
pub struct RequestVtable<D: 'static> {
    /// Handlers indexed by request opcode; must cover the whole
    /// request table of the interface.
    pub handlers: &'static [RequestHandler<D>],
}

impl<D> ObjectData<D> for RequestVtable<D> {
    fn request(
        self: Arc<Self>,
        handle: &Handle<D>,
        data: &mut D,
        client_id: ClientId,
        msg: Message<ObjectId, OwnedFd>,
    ) -> Option<Arc<dyn ObjectData<D>>> {
        (self.handlers[msg.opcode as usize])(handle, data, client_id, msg)
    }
}

pub(crate) struct Data<D: 'static> {
    pub(crate) user_data: Arc<dyn ObjectData<D>>,
    pub(crate) serial: u32,
}

impl<D> Clone for Data<D> {
    fn clone(&self) -> Self {
        Self { user_data: self.user_data.clone(), serial: self.serial }
    }
}

impl<D> fmt::Debug for Data<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Data").field("serial", &self.serial).finish_non_exhaustive()
    }
}

pub(crate) type PendingDestructor<D> = (Arc<dyn ObjectData<D>>, ClientId, ObjectId);

// Data of the core objects (display, registry, callback) handled
// directly by the dispatcher.
pub(crate) struct DumbObjectData;

impl<D> ObjectData<D> for DumbObjectData {
    fn request(
        self: Arc<Self>,
        _handle: &Handle<D>,
        _data: &mut D,
        _client_id: ClientId,
        _msg: Message<ObjectId, OwnedFd>,
    ) -> Option<Arc<dyn ObjectData<D>>> {
        unreachable!()
    }
}

// Placeholder data of a freshly created object, before its handler had
// the opportunity to provide the real one.
pub(crate) struct UninitObjectData;

impl<D> ObjectData<D> for UninitObjectData {
    fn request(
        self: Arc<Self>,
        _handle: &Handle<D>,
        _data: &mut D,
        _client_id: ClientId,
        msg: Message<ObjectId, OwnedFd>,
    ) -> Option<Arc<dyn ObjectData<D>>> {
        panic!("Received a message on an uninitialized object: {:?}", msg.sender_id);
    }
}

pub(crate) fn null_object_id(client_id: ClientId) -> ObjectId {
    ObjectId { id: 0, serial: 0, client_id, interface: &ANONYMOUS_INTERFACE }
}
