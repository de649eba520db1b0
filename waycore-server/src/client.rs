//! Per-client connection state and request intake.

use std::ffi::CString;
use std::io::ErrorKind;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;

use nix::errno::Errno;

use waycore_protocol::core_interfaces::{
    wl_display, WL_CALLBACK_INTERFACE, WL_DISPLAY_INTERFACE, WL_REGISTRY_INTERFACE,
};
use waycore_protocol::debug;
use waycore_protocol::message;
use waycore_protocol::protocol::{
    check_for_signature, same_interface_or_anonymous, Argument, Message, ObjectInfo,
    ProtocolError, INLINE_ARGS,
};
use waycore_protocol::socket::{BufferedSocket, Socket};
use waycore_protocol::wire::MessageParseError;

use smallvec::SmallVec;

use crate::map::{Object, ObjectFlags, ObjectMap, SERVER_ID_LIMIT};
use crate::registry::{BindError, Registry};
use crate::types::{Credentials, DisconnectReason, InvalidId, SendError};
use crate::{
    null_object_id, ClientData, ClientId, Data, DumbObjectData, GlobalHandler, GlobalId,
    ObjectData, ObjectId, PendingDestructor, UninitObjectData,
};

type ArgSmallVec = SmallVec<[Argument<ObjectId, OwnedFd>; INLINE_ARGS]>;

// codes of the wl_display error enum
#[repr(u32)]
#[derive(Copy, Clone, Debug)]
pub(crate) enum DisplayError {
    InvalidObject = 0,
    InvalidMethod = 1,
    NoMemory = 2,
}

// outcome of the request intake before dispatch proper
pub(crate) enum RequestError {
    /// I/O level outcome, `WouldBlock` meaning "no full frame yet".
    Io(std::io::Error),
    /// The client broke the protocol; the error is posted and the
    /// client torn down by the dispatcher.
    Violation { code: DisplayError, message: String },
}

pub(crate) struct Client<D: 'static> {
    socket: BufferedSocket,
    pub(crate) map: ObjectMap<Data<D>>,
    debug: bool,
    last_serial: u32,
    credentials: Credentials,
    pub(crate) id: ClientId,
    pub(crate) killed: bool,
    pub(crate) data: Arc<dyn ClientData>,
}

impl<D> std::fmt::Debug for ClientStore<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientStore").field("clients", &self.clients.len()).finish()
    }
}

impl<D> Client<D> {
    fn next_serial(&mut self) -> u32 {
        self.last_serial = self.last_serial.wrapping_add(1);
        self.last_serial
    }

    fn display_id(&self) -> ObjectId {
        ObjectId { id: 1, serial: 0, client_id: self.id.clone(), interface: &WL_DISPLAY_INTERFACE }
    }
}

impl<D> Client<D> {
    pub(crate) fn new(
        stream: UnixStream,
        id: ClientId,
        debug: bool,
        data: Arc<dyn ClientData>,
    ) -> std::io::Result<Self> {
        // snapshot the peer credentials while the socket is fresh
        let credentials = peer_credentials(&stream)?;
        let socket = BufferedSocket::new(Socket::from(stream));
        let mut map = ObjectMap::new();
        map.insert_at(
            1,
            Object {
                interface: &WL_DISPLAY_INTERFACE,
                version: 1,
                flags: ObjectFlags::empty(),
                data: Data { user_data: Arc::new(DumbObjectData), serial: 0 },
            },
        )
        .unwrap();

        data.initialized(id.clone());

        Ok(Self { socket, map, debug, id, killed: false, last_serial: 0, credentials, data })
    }

    pub(crate) fn create_object(
        &mut self,
        interface: &'static waycore_protocol::protocol::Interface,
        version: u32,
        flags: ObjectFlags,
        user_data: Arc<dyn ObjectData<D>>,
    ) -> ObjectId {
        let serial = self.next_serial();
        let id = self.map.server_insert_new(Object {
            interface,
            version,
            flags,
            data: Data { serial, user_data },
        });
        ObjectId { id, serial, client_id: self.id.clone(), interface }
    }

    pub(crate) fn object_info(&self, id: ObjectId) -> Result<ObjectInfo, InvalidId> {
        let object = self.get_object(id.clone())?;
        Ok(ObjectInfo { id: id.id, interface: object.interface, version: object.version })
    }

    pub(crate) fn get_credentials(&self) -> Credentials {
        self.credentials
    }

    pub(crate) fn send_event(
        &mut self,
        Message { sender_id: object_id, opcode, args }: Message<ObjectId, RawFd>,
        pending_destructors: Option<&mut Vec<PendingDestructor<D>>>,
    ) -> Result<(), SendError> {
        if self.killed {
            return Ok(());
        }
        let object = self.get_object(object_id.clone()).map_err(|_| SendError::InvalidId)?;

        let message_desc = match object.interface.events.get(opcode as usize) {
            Some(msg) => msg,
            None => {
                panic!(
                    "Unknown opcode {} for object {}@{}.",
                    opcode, object.interface.name, object_id.id
                );
            }
        };

        if !check_for_signature(message_desc.signature, &args) {
            panic!(
                "Unexpected signature for event {}@{}.{}: expected {:?}, got {:?}.",
                object.interface.name, object_id.id, message_desc.name, message_desc.signature, args
            );
        }

        if self.debug {
            debug::print_send_message(object.interface.name, object_id.id, message_desc.name, &args);
        }

        // resolve object-typed arguments to their wire ids, checking
        // they are live and of the advertised interface
        let mut msg_args = SmallVec::with_capacity(args.len());
        for (i, arg) in args.into_iter().enumerate() {
            msg_args.push(match arg {
                Argument::Array(a) => Argument::Array(a),
                Argument::Int(i) => Argument::Int(i),
                Argument::Uint(u) => Argument::Uint(u),
                Argument::Str(s) => Argument::Str(s),
                Argument::Fixed(f) => Argument::Fixed(f),
                Argument::Fd(f) => Argument::Fd(f),
                Argument::NewId(o) => {
                    if !o.is_null() {
                        if o.client_id != self.id {
                            panic!("Attempting to send an event with objects from wrong client.");
                        }
                        let arg_object =
                            self.get_object(o.clone()).map_err(|_| SendError::InvalidId)?;
                        let child_interface = match message_desc.types.get(i).copied().flatten() {
                            Some(iface) => iface,
                            None => panic!(
                                "Trying to send event {}@{}.{} which creates an object without specifying its interface, this is unsupported.",
                                object.interface.name, object_id.id, message_desc.name
                            ),
                        };
                        if !same_interface_or_anonymous(child_interface, arg_object.interface) {
                            panic!(
                                "Event {}@{}.{} expects a newid argument of interface {} but {} was provided instead.",
                                object.interface.name, object_id.id, message_desc.name,
                                child_interface.name, arg_object.interface.name
                            );
                        }
                    }
                    Argument::NewId(o.id)
                }
                Argument::Object(o) => {
                    if !o.is_null() {
                        if o.client_id != self.id {
                            panic!("Attempting to send an event with objects from wrong client.");
                        }
                        let arg_object =
                            self.get_object(o.clone()).map_err(|_| SendError::InvalidId)?;
                        if let Some(expected) = message_desc.types.get(i).copied().flatten() {
                            if !same_interface_or_anonymous(expected, arg_object.interface) {
                                panic!(
                                    "Event {}@{}.{} expects an object argument of interface {} but {} was provided instead.",
                                    object.interface.name, object_id.id, message_desc.name,
                                    expected.name, arg_object.interface.name
                                );
                            }
                        }
                    }
                    Argument::Object(o.id)
                }
            });
        }

        let msg = Message { sender_id: object_id.id, opcode, args: msg_args };

        if let Err(e) = self.socket.write_message(&msg, message_desc.signature) {
            match e.raw_os_error() {
                Some(code) if code == Errno::EINVAL as i32 => return Err(SendError::NullArgument),
                Some(code) if code == Errno::E2BIG as i32 => return Err(SendError::TooBig),
                _ => self.kill(DisconnectReason::ConnectionClosed),
            }
        }

        // Handle destruction if relevant
        if message_desc.is_destructor {
            if let Some(vec) = pending_destructors {
                vec.push((object.data.user_data.clone(), self.id.clone(), object_id.clone()));
            }
            self.send_delete_id(object_id);
        }

        Ok(())
    }

    pub(crate) fn send_delete_id(&mut self, object_id: ObjectId) {
        // delete_id is only meaningful for ids of the client range,
        // server ids are freed outright
        if object_id.id < SERVER_ID_LIMIT {
            let desc = &WL_DISPLAY_INTERFACE.events[wl_display::EVT_DELETE_ID as usize];
            let msg = message!(1, wl_display::EVT_DELETE_ID, [Argument::Uint(object_id.id)]);
            if self.socket.write_message(&msg, desc.signature).is_err() {
                self.kill(DisconnectReason::ConnectionClosed);
            }
        }
        self.map.remove(object_id.id);
    }

    pub(crate) fn get_object_data(
        &self,
        id: ObjectId,
    ) -> Result<Arc<dyn ObjectData<D>>, InvalidId> {
        let object = self.get_object(id)?;
        Ok(object.data.user_data)
    }

    pub(crate) fn set_object_data(
        &mut self,
        id: ObjectId,
        data: Arc<dyn ObjectData<D>>,
    ) -> Result<(), InvalidId> {
        self.map
            .with(id.id, |objdata| {
                if objdata.data.serial != id.serial {
                    Err(InvalidId)
                } else {
                    objdata.data.user_data = data;
                    Ok(())
                }
            })
            .unwrap_or(Err(InvalidId))
    }

    pub(crate) fn post_display_error(&mut self, code: DisplayError, message: String) {
        self.post_error(self.display_id(), code as u32, CString::new(message).unwrap())
    }

    pub(crate) fn post_error(&mut self, object_id: ObjectId, error_code: u32, message: CString) {
        let converted_message = message.to_string_lossy().into();
        // errors are ignored, as the client will be killed anyway
        let _ = self.send_event(
            message!(
                self.display_id(),
                wl_display::EVT_ERROR,
                [
                    Argument::Object(object_id.clone()),
                    Argument::Uint(error_code),
                    Argument::Str(Some(Box::new(message))),
                ],
            ),
            // wl_display.error is not a destructor, this argument is
            // not used
            None,
        );
        let _ = self.flush();
        self.kill(DisconnectReason::ProtocolError(ProtocolError {
            code: error_code,
            object_id: object_id.id,
            object_interface: object_id.interface.name.into(),
            message: converted_message,
        }));
    }

    pub(crate) fn kill(&mut self, reason: DisconnectReason) {
        if !self.killed {
            log::debug!("disconnecting client {:?}: {:?}", self.id, reason);
            self.killed = true;
            self.data.disconnected(self.id.clone(), reason);
        }
    }

    pub(crate) fn flush(&mut self) -> std::io::Result<()> {
        self.socket.flush()
    }

    pub(crate) fn all_objects(&self) -> impl Iterator<Item = ObjectId> + '_ {
        let client_id = self.id.clone();
        self.map.all_objects().map(move |(id, obj)| ObjectId {
            id,
            client_id: client_id.clone(),
            interface: obj.interface,
            serial: obj.data.serial,
        })
    }

    pub(crate) fn object_for_protocol_id(&self, pid: u32) -> Result<ObjectId, InvalidId> {
        let object = self.map.find(pid).ok_or(InvalidId)?;
        Ok(ObjectId {
            id: pid,
            client_id: self.id.clone(),
            serial: object.data.serial,
            interface: object.interface,
        })
    }

    pub(crate) fn queue_all_destructors(&mut self, pending_destructors: &mut Vec<PendingDestructor<D>>) {
        pending_destructors.extend(self.map.all_objects().map(|(id, obj)| {
            (
                obj.data.user_data.clone(),
                self.id.clone(),
                ObjectId {
                    id,
                    serial: obj.data.serial,
                    client_id: self.id.clone(),
                    interface: obj.interface,
                },
            )
        }));
    }

    /// Read and validate the next framed request.
    ///
    /// Framing, target id, opcode range and since-version are checked
    /// here; demarshalled messages come back with their raw `u32`
    /// object arguments, resolved later by `process_request`.
    pub(crate) fn next_request(
        &mut self,
    ) -> Result<(Message<u32, OwnedFd>, Object<Data<D>>), RequestError> {
        if self.killed {
            return Err(RequestError::Io(Errno::EPIPE.into()));
        }
        loop {
            let map = &self.map;
            let mut violation = None;
            let mut target = None;
            let msg = self.socket.read_one_message(|id, opcode| {
                let object = match map.find(id) {
                    Some(object) => object,
                    None => {
                        violation = Some(RequestError::Violation {
                            code: DisplayError::InvalidObject,
                            message: format!("invalid object {}", id),
                        });
                        return None;
                    }
                };
                let desc = match object.interface.requests.get(opcode as usize) {
                    Some(desc) => desc,
                    None => {
                        violation = Some(RequestError::Violation {
                            code: DisplayError::InvalidMethod,
                            message: format!(
                                "invalid method {}, object {}@{}",
                                opcode, object.interface.name, id
                            ),
                        });
                        return None;
                    }
                };
                if !object.flags.contains(ObjectFlags::LEGACY) && object.version < desc.since() {
                    violation = Some(RequestError::Violation {
                        code: DisplayError::InvalidMethod,
                        message: format!(
                            "invalid method {}, object {}@{}",
                            opcode, object.interface.name, id
                        ),
                    });
                    return None;
                }
                target = Some((id, object.interface.name, desc.name));
                Some(desc.signature)
            });
            let msg = match msg {
                Ok(msg) => msg,
                Err(MessageParseError::MissingData) | Err(MessageParseError::MissingFD) => {
                    // need to read more data
                    if let Err(e) = self.socket.fill_incoming_buffers() {
                        if e.kind() != ErrorKind::WouldBlock {
                            self.kill(DisconnectReason::ConnectionClosed);
                        }
                        return Err(RequestError::Io(e));
                    }
                    continue;
                }
                Err(MessageParseError::Malformed) => {
                    return Err(violation.unwrap_or_else(|| {
                        // the target was valid, the payload was not
                        let (id, interface, method) =
                            target.expect("malformed message with no target");
                        RequestError::Violation {
                            code: DisplayError::InvalidMethod,
                            message: format!(
                                "invalid arguments for {}@{}.{}",
                                interface, id, method
                            ),
                        }
                    }));
                }
            };

            let obj = self.map.find(msg.sender_id).unwrap();

            if self.debug {
                debug::print_dispatched_message(
                    obj.interface.name,
                    msg.sender_id,
                    obj.interface.requests[msg.opcode as usize].name,
                    &msg.args,
                );
            }

            return Ok((msg, obj));
        }
    }

    pub(crate) fn get_object(&self, id: ObjectId) -> Result<Object<Data<D>>, InvalidId> {
        let object = self.map.find(id.id).ok_or(InvalidId)?;
        if object.data.serial != id.serial {
            return Err(InvalidId);
        }
        Ok(object)
    }

    pub(crate) fn handle_display_request(
        &mut self,
        message: Message<u32, OwnedFd>,
        serial: u32,
        registry: &mut Registry<D>,
    ) {
        match message.opcode {
            // wl_display.sync(new id wl_callback)
            wl_display::REQ_SYNC => {
                if let [Argument::NewId(new_id)] = message.args[..] {
                    let obj_serial = self.next_serial();
                    let callback_obj = Object {
                        interface: &WL_CALLBACK_INTERFACE,
                        version: 1,
                        flags: ObjectFlags::empty(),
                        data: Data { user_data: Arc::new(DumbObjectData), serial: obj_serial },
                    };
                    if self.map.insert_at(new_id, callback_obj).is_err() {
                        self.post_display_error(
                            DisplayError::InvalidObject,
                            format!("invalid new id {}", new_id),
                        );
                        return;
                    }
                    let cb_id = ObjectId {
                        id: new_id,
                        client_id: self.id.clone(),
                        serial: obj_serial,
                        interface: &WL_CALLBACK_INTERFACE,
                    };
                    // wl_callback.done carries the current display
                    // serial and is a destructor, so the callback is
                    // reaped right away
                    self.send_event(message!(cb_id, 0, [Argument::Uint(serial)]), None).unwrap();
                } else {
                    unreachable!()
                }
            }
            // wl_display.get_registry(new id wl_registry)
            wl_display::REQ_GET_REGISTRY => {
                if let [Argument::NewId(new_id)] = message.args[..] {
                    let obj_serial = self.next_serial();
                    let registry_obj = Object {
                        interface: &WL_REGISTRY_INTERFACE,
                        version: 1,
                        flags: ObjectFlags::empty(),
                        data: Data { user_data: Arc::new(DumbObjectData), serial: obj_serial },
                    };
                    let registry_id = ObjectId {
                        id: new_id,
                        serial: obj_serial,
                        client_id: self.id.clone(),
                        interface: &WL_REGISTRY_INTERFACE,
                    };
                    if self.map.insert_at(new_id, registry_obj).is_err() {
                        self.post_display_error(
                            DisplayError::InvalidObject,
                            format!("invalid new id {}", new_id),
                        );
                        return;
                    }
                    let _ = registry.new_registry(registry_id, self);
                } else {
                    unreachable!()
                }
            }
            _ => {
                // unknown opcode, kill the client
                self.post_display_error(
                    DisplayError::InvalidMethod,
                    format!("invalid method {}, object wl_display@1", message.opcode),
                );
            }
        }
    }

    #[allow(clippy::type_complexity)]
    pub(crate) fn handle_registry_request(
        &mut self,
        message: Message<u32, OwnedFd>,
        registry: &mut Registry<D>,
    ) -> Option<(ClientId, GlobalId, ObjectId, Arc<dyn GlobalHandler<D>>)> {
        match message.opcode {
            // wl_registry.bind(uint name, str interface, uint version, new id)
            0 => {
                if let [Argument::Uint(name), Argument::Str(Some(ref interface_name)), Argument::Uint(version), Argument::NewId(new_id)] =
                    message.args[..]
                {
                    let interface_name = interface_name.to_string_lossy();
                    match registry.check_bind(self.id.clone(), name, interface_name.as_ref(), version)
                    {
                        Ok((interface, global_id, handler)) => {
                            let serial = self.next_serial();
                            let object = Object {
                                interface,
                                version,
                                flags: ObjectFlags::empty(),
                                data: Data { serial, user_data: Arc::new(UninitObjectData) },
                            };
                            if self.map.insert_at(new_id, object).is_err() {
                                self.post_display_error(
                                    DisplayError::InvalidObject,
                                    format!("invalid new id {}", new_id),
                                );
                                return None;
                            }
                            Some((
                                self.id.clone(),
                                global_id,
                                ObjectId {
                                    id: new_id,
                                    client_id: self.id.clone(),
                                    interface,
                                    serial,
                                },
                                handler,
                            ))
                        }
                        Err(BindError::Invalid) => {
                            self.post_display_error(
                                DisplayError::InvalidObject,
                                format!("invalid global {} ({})", interface_name, name),
                            );
                            None
                        }
                        Err(BindError::Version { have }) => {
                            self.post_display_error(
                                DisplayError::InvalidObject,
                                format!(
                                    "invalid version for global {} ({}): have {}, wanted {}",
                                    interface_name, name, have, version
                                ),
                            );
                            None
                        }
                    }
                } else {
                    unreachable!()
                }
            }
            _ => {
                // unknown opcode, kill the client
                self.post_display_error(
                    DisplayError::InvalidMethod,
                    format!("invalid method {}, object wl_registry", message.opcode),
                );
                None
            }
        }
    }

    /// The lookup-objects pass: resolve raw object arguments against
    /// the map and create the objects announced by typed new_id
    /// arguments.
    pub(crate) fn process_request(
        &mut self,
        object: &Object<Data<D>>,
        message: Message<u32, OwnedFd>,
    ) -> Option<(ArgSmallVec, bool, Option<ObjectId>)> {
        let message_desc = object.interface.requests.get(message.opcode as usize).unwrap();
        let mut new_args = SmallVec::with_capacity(message.args.len());
        let mut created_id = None;
        for (i, arg) in message.args.into_iter().enumerate() {
            new_args.push(match arg {
                Argument::Array(a) => Argument::Array(a),
                Argument::Int(i) => Argument::Int(i),
                Argument::Uint(u) => Argument::Uint(u),
                Argument::Str(s) => Argument::Str(s),
                Argument::Fixed(f) => Argument::Fixed(f),
                Argument::Fd(f) => Argument::Fd(f),
                Argument::Object(o) => {
                    if o != 0 {
                        let obj = match self.map.find(o) {
                            Some(obj) => obj,
                            None => {
                                self.post_display_error(
                                    DisplayError::InvalidObject,
                                    format!("invalid object {}", o),
                                );
                                return None;
                            }
                        };
                        if let Some(expected) = message_desc.types.get(i).copied().flatten() {
                            if !same_interface_or_anonymous(expected, obj.interface) {
                                self.post_display_error(
                                    DisplayError::InvalidObject,
                                    format!(
                                        "invalid object {} in request {}.{}: expected {} but got {}",
                                        o,
                                        object.interface.name,
                                        message_desc.name,
                                        expected.name,
                                        obj.interface.name,
                                    ),
                                );
                                return None;
                            }
                        }
                        Argument::Object(ObjectId {
                            id: o,
                            client_id: self.id.clone(),
                            serial: obj.data.serial,
                            interface: obj.interface,
                        })
                    } else {
                        // the codec only lets a 0 id through when the
                        // argument is nullable
                        Argument::Object(null_object_id(self.id.clone()))
                    }
                }
                Argument::NewId(new_id) => {
                    if new_id == 0 {
                        Argument::NewId(null_object_id(self.id.clone()))
                    } else {
                        let child_interface = match message_desc.types.get(i).copied().flatten() {
                            Some(iface) => iface,
                            None => panic!(
                                "Received request {}@{}.{} which creates an object without specifying its interface, this is unsupported.",
                                object.interface.name, message.sender_id, message_desc.name
                            ),
                        };

                        let child_obj = Object {
                            interface: child_interface,
                            version: object.version,
                            flags: ObjectFlags::empty(),
                            data: Data {
                                user_data: Arc::new(UninitObjectData),
                                serial: self.next_serial(),
                            },
                        };

                        let child_id = ObjectId {
                            id: new_id,
                            client_id: self.id.clone(),
                            serial: child_obj.data.serial,
                            interface: child_interface,
                        };
                        created_id = Some(child_id.clone());

                        if self.map.insert_at(new_id, child_obj).is_err() {
                            // abort parsing, this is an unrecoverable error
                            self.post_display_error(
                                DisplayError::InvalidObject,
                                format!("invalid new id {}", new_id),
                            );
                            return None;
                        }

                        Argument::NewId(child_id)
                    }
                }
            });
        }
        Some((new_args, message_desc.is_destructor, created_id))
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn peer_credentials(stream: &UnixStream) -> std::io::Result<Credentials> {
    let creds =
        nix::sys::socket::getsockopt(stream.as_raw_fd(), nix::sys::socket::sockopt::PeerCredentials)?;
    Ok(Credentials { pid: creds.pid(), uid: creds.uid(), gid: creds.gid() })
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn peer_credentials(_stream: &UnixStream) -> std::io::Result<Credentials> {
    Ok(Credentials { pid: 0, uid: 0, gid: 0 })
}

pub(crate) struct ClientStore<D: 'static> {
    clients: Vec<Option<Client<D>>>,
    last_serial: u32,
    debug: bool,
}

impl<D> ClientStore<D> {
    pub(crate) fn new(debug: bool) -> Self {
        Self { clients: Vec::new(), last_serial: 0, debug }
    }

    pub(crate) fn create_client(
        &mut self,
        stream: UnixStream,
        data: Arc<dyn ClientData>,
    ) -> std::io::Result<ClientId> {
        let serial = self.next_serial();
        // Find the next free place
        let (id, place) = match self.clients.iter_mut().enumerate().find(|(_, c)| c.is_none()) {
            Some((id, place)) => (id, place),
            None => {
                self.clients.push(None);
                (self.clients.len() - 1, self.clients.last_mut().unwrap())
            }
        };

        let id = ClientId { id: id as u32, serial };

        *place = Some(Client::new(stream, id.clone(), self.debug, data)?);

        Ok(id)
    }

    pub(crate) fn get_client(&self, id: ClientId) -> Result<&Client<D>, InvalidId> {
        match self.clients.get(id.id as usize) {
            Some(Some(client)) if client.id == id => Ok(client),
            _ => Err(InvalidId),
        }
    }

    pub(crate) fn get_client_mut(&mut self, id: ClientId) -> Result<&mut Client<D>, InvalidId> {
        match self.clients.get_mut(id.id as usize) {
            Some(&mut Some(ref mut client)) if client.id == id => Ok(client),
            _ => Err(InvalidId),
        }
    }

    pub(crate) fn cleanup(
        &mut self,
        pending_destructors: &mut Vec<PendingDestructor<D>>,
    ) -> SmallVec<[Client<D>; 1]> {
        let mut cleaned = SmallVec::new();
        for place in &mut self.clients {
            if place.as_ref().map(|client| client.killed).unwrap_or(false) {
                // Remove the client from the store and flush it one
                // last time before dropping it
                let mut client = place.take().unwrap();
                client.queue_all_destructors(pending_destructors);
                let _ = client.flush();
                cleaned.push(client);
            }
        }
        cleaned
    }

    fn next_serial(&mut self) -> u32 {
        self.last_serial = self.last_serial.wrapping_add(1);
        self.last_serial
    }

    pub(crate) fn clients_mut(&mut self) -> impl Iterator<Item = &mut Client<D>> {
        self.clients.iter_mut().flat_map(|o| o.as_mut()).filter(|c| !c.killed)
    }

    pub(crate) fn all_clients_id(&self) -> impl Iterator<Item = ClientId> + '_ {
        self.clients
            .iter()
            .flat_map(|opt| opt.as_ref().filter(|c| !c.killed).map(|client| client.id.clone()))
    }
}
