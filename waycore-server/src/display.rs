//! The display: entry points driven by the embedding reactor.

use std::io::{ErrorKind, Result as IoResult};
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex};

use waycore_protocol::core_interfaces::{WL_DISPLAY_INTERFACE, WL_REGISTRY_INTERFACE};
use waycore_protocol::protocol::{same_interface, Argument, Message};

use smallvec::SmallVec;

use crate::client::RequestError;
use crate::handle::{Handle, State};
use crate::map::Object;
use crate::types::{DisconnectReason, Readiness};
use crate::{ClientData, ClientId, Data, GlobalHandler, GlobalId, ObjectId};

/// The display: owner of the client store, the globals and the serial
/// counter.
///
/// All dispatching runs on the thread calling into it; handlers run to
/// completion before the next request is read. The I/O readiness loop
/// itself is external: the embedder watches the client connections and
/// reports their state through [`Readiness`] masks.
pub struct Display<D: 'static> {
    state: Arc<Mutex<State<D>>>,
}

impl<D> std::fmt::Debug for Display<D> {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("Display").finish_non_exhaustive()
    }
}

impl<D> Default for Display<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D> Display<D> {
    /// Create a new display.
    ///
    /// Wire tracing is enabled here if `WAYLAND_DEBUG` asks for it.
    pub fn new() -> Self {
        Self { state: Arc::new(Mutex::new(State::new())) }
    }

    /// Get a cloneable handle to the display state.
    pub fn handle(&self) -> Handle<D> {
        Handle { state: self.state.clone() }
    }

    /// Register a connected client.
    ///
    /// The stream is adopted; its peer credentials are snapshotted
    /// now. On error the stream is dropped and nothing is registered.
    pub fn insert_client(
        &self,
        stream: UnixStream,
        data: Arc<dyn ClientData>,
    ) -> IoResult<ClientId> {
        self.state.lock().unwrap().clients.create_client(stream, data)
    }

    /// React to a readiness event on a client connection.
    ///
    /// Error and hangup destroy the client; writable flushes its
    /// pending events; readable reads and dispatches every complete
    /// frame. Returns the number of dispatched requests.
    pub fn dispatch_client(
        &self,
        data: &mut D,
        client_id: &ClientId,
        mask: Readiness,
    ) -> IoResult<usize> {
        let mut dispatched = 0;
        let mut result = Ok(());

        if mask.intersects(Readiness::ERROR | Readiness::HANGUP) {
            self.handle().kill_client(client_id);
        } else {
            if mask.contains(Readiness::WRITABLE) {
                let mut state = self.state.lock().unwrap();
                if let Ok(client) = state.clients.get_client_mut(client_id.clone()) {
                    if let Err(e) = client.flush() {
                        // a short write is fine, the rest stays queued
                        // for the next writable event
                        if e.kind() != ErrorKind::WouldBlock {
                            client.kill(DisconnectReason::ConnectionClosed);
                        }
                    }
                }
            }
            if mask.contains(Readiness::READABLE) {
                match self.dispatch_events_for(data, client_id) {
                    Ok(count) => dispatched = count,
                    // no complete frame available
                    Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                    // connection-level failures have already killed
                    // the client
                    Err(e)
                        if e.kind() == ErrorKind::BrokenPipe
                            || e.kind() == ErrorKind::ConnectionReset => {}
                    Err(e) => result = Err(e),
                }
            }
        }

        let cleanup = self.state.lock().unwrap().cleanup();
        cleanup(&self.handle(), data);
        result.map(|()| dispatched)
    }

    /// Dispatch every client with buffered or readable data.
    ///
    /// A convenience wrapper over [`Self::dispatch_client`] for
    /// embedders polling all clients at once.
    pub fn dispatch_all_clients(&self, data: &mut D) -> IoResult<usize> {
        let clients: Vec<ClientId> =
            self.state.lock().unwrap().clients.all_clients_id().collect();
        let mut dispatched = 0;
        for client_id in clients {
            dispatched += self.dispatch_client(data, &client_id, Readiness::READABLE)?;
        }
        Ok(dispatched)
    }

    /// Flush the write buffers of every client.
    ///
    /// Clients that cannot make progress right now (`EAGAIN`) keep
    /// their events queued; clients whose connection failed are
    /// destroyed. The destruction callbacks run at the next dispatch.
    pub fn flush_clients(&self) -> IoResult<()> {
        let mut state = self.state.lock().unwrap();
        for client in state.clients.clients_mut() {
            if let Err(e) = client.flush() {
                if e.kind() != ErrorKind::WouldBlock {
                    client.kill(DisconnectReason::ConnectionClosed);
                }
            }
        }
        Ok(())
    }

    fn dispatch_events_for(&self, data: &mut D, client_id: &ClientId) -> IoResult<usize> {
        let mut dispatched = 0;
        let handle = self.handle();
        let mut state = self.state.lock().unwrap();
        loop {
            let action = {
                let state = &mut *state;
                let client = match state.clients.get_client_mut(client_id.clone()) {
                    Ok(client) => client,
                    Err(_) => {
                        return Err(std::io::Error::new(
                            ErrorKind::InvalidInput,
                            "invalid client id",
                        ))
                    }
                };
                let (message, object) = match client.next_request() {
                    Ok(v) => v,
                    Err(RequestError::Io(e)) if e.kind() == ErrorKind::WouldBlock => {
                        if dispatched > 0 {
                            break;
                        } else {
                            return Err(e);
                        }
                    }
                    Err(RequestError::Io(e)) => return Err(e),
                    Err(RequestError::Violation { code, message }) => {
                        // protocol errors are terminal: post the error
                        // and stop reading from this client for good
                        client.post_display_error(code, message);
                        break;
                    }
                };
                dispatched += 1;
                if same_interface(object.interface, &WL_DISPLAY_INTERFACE) {
                    let serial = state.serial;
                    client.handle_display_request(message, serial, &mut state.registry);
                    continue;
                } else if same_interface(object.interface, &WL_REGISTRY_INTERFACE) {
                    if let Some((client, global, object, handler)) =
                        client.handle_registry_request(message, &mut state.registry)
                    {
                        DispatchAction::Bind { client, global, object, handler }
                    } else {
                        continue;
                    }
                } else {
                    let object_id = ObjectId {
                        id: message.sender_id,
                        serial: object.data.serial,
                        interface: object.interface,
                        client_id: client.id.clone(),
                    };
                    let opcode = message.opcode;
                    let (arguments, is_destructor, created_id) =
                        match client.process_request(&object, message) {
                            Some(args) => args,
                            None => continue,
                        };
                    // Carry the whole set out of the borrow so the
                    // handler can be invoked with the state unlocked
                    DispatchAction::Request {
                        object,
                        object_id,
                        opcode,
                        arguments,
                        is_destructor,
                        created_id,
                    }
                }
            };
            match action {
                DispatchAction::Request {
                    object,
                    object_id,
                    opcode,
                    arguments,
                    is_destructor,
                    created_id,
                } => {
                    // release the state while the handler runs, it may
                    // re-enter through the handle
                    std::mem::drop(state);
                    let ret = object.data.user_data.clone().request(
                        &handle,
                        data,
                        client_id.clone(),
                        Message { sender_id: object_id.clone(), opcode, args: arguments },
                    );
                    if is_destructor {
                        object.data.user_data.clone().destroyed(
                            &handle,
                            data,
                            client_id.clone(),
                            object_id.clone(),
                        );
                    }
                    state = self.state.lock().unwrap();
                    if is_destructor {
                        if let Ok(client) = state.clients.get_client_mut(client_id.clone()) {
                            client.send_delete_id(object_id);
                        }
                    }
                    match (created_id, ret) {
                        (Some(child_id), Some(child_data)) => {
                            if let Ok(client) = state.clients.get_client_mut(client_id.clone()) {
                                client
                                    .map
                                    .with(child_id.id, |obj| obj.data.user_data = child_data)
                                    .unwrap();
                            }
                        }
                        (None, None) => {}
                        (Some(child_id), None) => {
                            // the callback may skip providing data if
                            // the client is already dead (e.g. it
                            // provoked a protocol error)
                            if let Ok(client) = state.clients.get_client(client_id.clone()) {
                                if !client.killed {
                                    panic!(
                                        "Callback creating object {child_id} did not provide any object data."
                                    );
                                }
                            }
                        }
                        (None, Some(_)) => {
                            panic!("An object data was returned from a callback not creating any object");
                        }
                    }
                }
                DispatchAction::Bind { object, client, global, handler } => {
                    // same unlocking dance around the bind callback
                    std::mem::drop(state);
                    let child_data = handler.bind(
                        &handle,
                        data,
                        client.clone(),
                        global,
                        object.clone(),
                    );
                    state = self.state.lock().unwrap();
                    if let Ok(client) = state.clients.get_client_mut(client.clone()) {
                        client.map.with(object.id, |obj| obj.data.user_data = child_data).unwrap();
                    }
                }
            }
        }
        Ok(dispatched)
    }
}

enum DispatchAction<D: 'static> {
    Request {
        object: Object<Data<D>>,
        object_id: ObjectId,
        opcode: u16,
        arguments: SmallVec<[Argument<ObjectId, std::os::unix::io::OwnedFd>; 4]>,
        is_destructor: bool,
        created_id: Option<ObjectId>,
    },
    Bind {
        object: ObjectId,
        client: ClientId,
        global: GlobalId,
        handler: Arc<dyn GlobalHandler<D>>,
    },
}
