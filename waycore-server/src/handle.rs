//! The shared server state and its cloneable accessor.

use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, Weak};

use waycore_protocol::protocol::{same_interface, Interface, Message, ObjectInfo};

use crate::client::{ClientStore, DisplayError};
use crate::map::ObjectFlags;
use crate::registry::Registry;
use crate::types::{Credentials, DisconnectReason, GlobalInfo, InvalidId, SendError};
use crate::{
    null_object_id, ClientData, ClientId, GlobalHandler, GlobalId, ObjectData, ObjectId,
    PendingDestructor,
};

pub(crate) struct State<D: 'static> {
    pub(crate) clients: ClientStore<D>,
    pub(crate) registry: Registry<D>,
    pub(crate) pending_destructors: Vec<PendingDestructor<D>>,
    pub(crate) serial: u32,
    pub(crate) shm_formats: Vec<u32>,
}

impl<D> State<D> {
    pub(crate) fn new() -> Self {
        let debug = waycore_protocol::debug::has_debug_server_env();
        Self {
            clients: ClientStore::new(debug),
            registry: Registry::new(),
            pending_destructors: Vec::new(),
            serial: 0,
            shm_formats: Vec::new(),
        }
    }

    /// Reap killed clients and collect the deferred destructors.
    ///
    /// Returns a closure performing the callbacks, to be invoked once
    /// the state lock has been released.
    pub(crate) fn cleanup(&mut self) -> impl FnOnce(&Handle<D>, &mut D) {
        let dead_clients = self.clients.cleanup(&mut self.pending_destructors);
        let dead_ids: Vec<ClientId> = dead_clients.iter().map(|client| client.id.clone()).collect();
        self.registry.cleanup(&dead_ids);
        let pending_destructors = std::mem::take(&mut self.pending_destructors);
        move |handle, data| {
            for (object_data, client_id, object_id) in pending_destructors {
                object_data.destroyed(handle, data, client_id, object_id);
            }
            std::mem::drop(dead_clients);
        }
    }

    pub(crate) fn flush(&mut self, client: Option<ClientId>) -> std::io::Result<()> {
        if let Some(client) = client {
            match self.clients.get_client_mut(client) {
                Ok(client) => client.flush(),
                Err(InvalidId) => Ok(()),
            }
        } else {
            for client in self.clients.clients_mut() {
                let _ = client.flush();
            }
            Ok(())
        }
    }
}

/// Accessor to the server state, cloneable and usable from request
/// handlers.
pub struct Handle<D: 'static> {
    pub(crate) state: Arc<Mutex<State<D>>>,
}

impl<D> Clone for Handle<D> {
    fn clone(&self) -> Self {
        Self { state: self.state.clone() }
    }
}

impl<D> std::fmt::Debug for Handle<D> {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("Handle").finish_non_exhaustive()
    }
}

/// A handle that does not keep the server state alive.
pub struct WeakHandle<D: 'static> {
    state: Weak<Mutex<State<D>>>,
}

impl<D> Clone for WeakHandle<D> {
    fn clone(&self) -> Self {
        Self { state: self.state.clone() }
    }
}

impl<D> WeakHandle<D> {
    /// Attempt to upgrade to a full handle.
    pub fn upgrade(&self) -> Option<Handle<D>> {
        self.state.upgrade().map(|state| Handle { state })
    }
}

impl<D> Handle<D> {
    /// Downgrade to a handle that does not keep the state alive.
    pub fn downgrade(&self) -> WeakHandle<D> {
        WeakHandle { state: Arc::downgrade(&self.state) }
    }

    /// Protocol information (id, interface, version) of an object.
    pub fn object_info(&self, id: &ObjectId) -> Result<ObjectInfo, InvalidId> {
        let state = self.state.lock().unwrap();
        state.clients.get_client(id.client_id.clone())?.object_info(id.clone())
    }

    /// The client owning an object.
    pub fn get_client(&self, id: &ObjectId) -> Result<ClientId, InvalidId> {
        let state = self.state.lock().unwrap();
        if state.clients.get_client(id.client_id.clone()).is_ok() {
            Ok(id.client_id.clone())
        } else {
            Err(InvalidId)
        }
    }

    /// The lifecycle data of a client.
    pub fn get_client_data(&self, id: &ClientId) -> Result<Arc<dyn ClientData>, InvalidId> {
        let state = self.state.lock().unwrap();
        Ok(state.clients.get_client(id.clone())?.data.clone())
    }

    /// Unix credentials of a client, snapshotted at accept time.
    pub fn get_client_credentials(&self, id: &ClientId) -> Result<Credentials, InvalidId> {
        let state = self.state.lock().unwrap();
        Ok(state.clients.get_client(id.clone())?.get_credentials())
    }

    /// Invoke a closure for every connected client.
    pub fn with_all_clients(&self, mut f: impl FnMut(ClientId)) {
        let state = self.state.lock().unwrap();
        for client in state.clients.all_clients_id() {
            f(client);
        }
    }

    /// Invoke a closure for every object of a client, ascending id
    /// order.
    pub fn with_all_objects_for(
        &self,
        client_id: &ClientId,
        mut f: impl FnMut(ObjectId),
    ) -> Result<(), InvalidId> {
        let state = self.state.lock().unwrap();
        let client = state.clients.get_client(client_id.clone())?;
        for object in client.all_objects() {
            f(object);
        }
        Ok(())
    }

    /// Look up an object of a client by its protocol id.
    pub fn object_for_protocol_id(
        &self,
        client_id: &ClientId,
        interface: &'static Interface,
        protocol_id: u32,
    ) -> Result<ObjectId, InvalidId> {
        let state = self.state.lock().unwrap();
        let client = state.clients.get_client(client_id.clone())?;
        let object = client.object_for_protocol_id(protocol_id)?;
        if same_interface(interface, object.interface) {
            Ok(object)
        } else {
            Err(InvalidId)
        }
    }

    /// Create a server-allocated object for a client.
    pub fn create_object(
        &self,
        client_id: &ClientId,
        interface: &'static Interface,
        version: u32,
        data: Arc<dyn ObjectData<D>>,
    ) -> Result<ObjectId, InvalidId> {
        self.create_object_with_flags(client_id, interface, version, ObjectFlags::empty(), data)
    }

    /// Create a server-allocated object with explicit map-entry flags.
    ///
    /// [`ObjectFlags::LEGACY`] marks the object for the vtable
    /// compatibility path and exempts it from since-version checks.
    pub fn create_object_with_flags(
        &self,
        client_id: &ClientId,
        interface: &'static Interface,
        version: u32,
        flags: ObjectFlags,
        data: Arc<dyn ObjectData<D>>,
    ) -> Result<ObjectId, InvalidId> {
        let mut state = self.state.lock().unwrap();
        let client = state.clients.get_client_mut(client_id.clone())?;
        Ok(client.create_object(interface, version, flags, data))
    }

    /// The null object id, usable as a nullable argument.
    pub fn null_id(client_id: ClientId) -> ObjectId {
        null_object_id(client_id)
    }

    /// Queue an event on the sender's connection.
    ///
    /// Events are never written eagerly; they sit in the client's
    /// write buffer until the next flush.
    pub fn send_event(&self, msg: Message<ObjectId, RawFd>) -> Result<(), SendError> {
        let mut state = self.state.lock().unwrap();
        let state = &mut *state;
        state
            .clients
            .get_client_mut(msg.sender_id.client_id.clone())
            .map_err(|_| SendError::InvalidId)?
            .send_event(msg, Some(&mut state.pending_destructors))
    }

    /// The data associated with an object.
    pub fn get_object_data(&self, id: &ObjectId) -> Result<Arc<dyn ObjectData<D>>, InvalidId> {
        let state = self.state.lock().unwrap();
        state.clients.get_client(id.client_id.clone())?.get_object_data(id.clone())
    }

    /// Replace the data associated with an object.
    pub fn set_object_data(
        &self,
        id: &ObjectId,
        data: Arc<dyn ObjectData<D>>,
    ) -> Result<(), InvalidId> {
        let mut state = self.state.lock().unwrap();
        state.clients.get_client_mut(id.client_id.clone())?.set_object_data(id.clone(), data)
    }

    /// Post a protocol error on an object and schedule its client for
    /// destruction.
    pub fn post_error(&self, id: &ObjectId, error_code: u32, message: CString) {
        let mut state = self.state.lock().unwrap();
        if let Ok(client) = state.clients.get_client_mut(id.client_id.clone()) {
            client.post_error(id.clone(), error_code, message);
        }
    }

    /// Post the standard out-of-memory error to a client.
    pub fn post_no_memory(&self, client_id: &ClientId) {
        let mut state = self.state.lock().unwrap();
        if let Ok(client) = state.clients.get_client_mut(client_id.clone()) {
            client.post_display_error(DisplayError::NoMemory, "no memory".into());
        }
    }

    /// Destroy an object: its destroy callback will run at the next
    /// dispatch turn, and `delete_id` is queued for client-allocated
    /// ids.
    pub fn destroy_object(&self, id: &ObjectId) -> Result<(), InvalidId> {
        let mut state = self.state.lock().unwrap();
        let state = &mut *state;
        let client = state.clients.get_client_mut(id.client_id.clone())?;
        let object = client.get_object(id.clone())?;
        state.pending_destructors.push((
            object.data.user_data.clone(),
            id.client_id.clone(),
            id.clone(),
        ));
        client.send_delete_id(id.clone());
        Ok(())
    }

    /// Schedule a client for destruction.
    pub fn kill_client(&self, client_id: &ClientId) {
        let mut state = self.state.lock().unwrap();
        if let Ok(client) = state.clients.get_client_mut(client_id.clone()) {
            client.kill(DisconnectReason::ConnectionClosed);
        }
    }

    /// Create a new global; it is advertised to every client with a
    /// bound registry.
    pub fn create_global(
        &self,
        interface: &'static Interface,
        version: u32,
        handler: Arc<dyn GlobalHandler<D>>,
    ) -> GlobalId {
        let mut state = self.state.lock().unwrap();
        let state = &mut *state;
        state.registry.create_global(interface, version, handler, &mut state.clients)
    }

    /// Remove a global: `global_remove` is broadcast first, then the
    /// global is unlinked.
    pub fn remove_global(&self, id: GlobalId) {
        let mut state = self.state.lock().unwrap();
        let state = &mut *state;
        state.registry.remove_global(id, &mut state.clients);
    }

    /// Interface and version of a global.
    pub fn global_info(&self, id: GlobalId) -> Result<GlobalInfo, InvalidId> {
        let state = self.state.lock().unwrap();
        state.registry.get_info(id)
    }

    /// The handler of a global.
    pub fn get_global_handler(&self, id: GlobalId) -> Result<Arc<dyn GlobalHandler<D>>, InvalidId> {
        let state = self.state.lock().unwrap();
        state.registry.get_handler(id)
    }

    /// The current event serial, without advancing it.
    pub fn serial(&self) -> u32 {
        self.state.lock().unwrap().serial
    }

    /// Increment the event serial and return the new value.
    pub fn next_serial(&self) -> u32 {
        let mut state = self.state.lock().unwrap();
        state.serial = state.serial.wrapping_add(1);
        state.serial
    }

    /// Advertise an additional pixel format.
    pub fn add_shm_format(&self, format: u32) {
        self.state.lock().unwrap().shm_formats.push(format);
    }

    /// The advertised additional pixel formats.
    pub fn shm_formats(&self) -> Vec<u32> {
        self.state.lock().unwrap().shm_formats.clone()
    }

    /// Flush the write buffer of one client, or of all clients.
    pub fn flush(&self, client: Option<&ClientId>) -> std::io::Result<()> {
        self.state.lock().unwrap().flush(client.cloned())
    }
}
