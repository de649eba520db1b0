//! The global list and its registry fan-out.

use std::ffi::CString;
use std::sync::Arc;

use waycore_protocol::core_interfaces::wl_registry;
use waycore_protocol::message;
use waycore_protocol::protocol::{Argument, Interface};

use crate::client::{Client, ClientStore};
use crate::types::{GlobalInfo, InvalidId, SendError};
use crate::{ClientId, GlobalHandler, GlobalId, ObjectId};

struct Global<D: 'static> {
    id: GlobalId,
    interface: &'static Interface,
    version: u32,
    handler: Arc<dyn GlobalHandler<D>>,
}

/// Why a bind request was refused.
pub(crate) enum BindError {
    /// No such global, or the advertised interface does not match.
    Invalid,
    /// The requested version is higher than the advertised one.
    Version { have: u32 },
}

pub(crate) struct Registry<D: 'static> {
    globals: Vec<Global<D>>,
    known_registries: Vec<ObjectId>,
    // the name counter; global names are never re-used
    next_name: u32,
}

impl<D> Registry<D> {
    pub(crate) fn new() -> Self {
        Self { globals: Vec::new(), known_registries: Vec::new(), next_name: 1 }
    }

    pub(crate) fn create_global(
        &mut self,
        interface: &'static Interface,
        version: u32,
        handler: Arc<dyn GlobalHandler<D>>,
        clients: &mut ClientStore<D>,
    ) -> GlobalId {
        if version > interface.version {
            panic!(
                "Cannot create global {} version {}: the interface only supports version {}.",
                interface.name, version, interface.version
            );
        }

        let id = GlobalId { name: self.next_name };
        self.next_name += 1;

        self.globals.push(Global { id, interface, version, handler });

        // advertise the newcomer to every bound registry
        let global = self.globals.last().unwrap();
        for registry in self.known_registries.iter().cloned().collect::<Vec<_>>() {
            if let Ok(client) = clients.get_client_mut(registry.client_id.clone()) {
                if global.handler.can_view(client.id.clone(), global.id) {
                    // don't fail the whole broadcast for a single
                    // erroring client
                    let _ = send_global_to(client, global, registry);
                }
            }
        }

        id
    }

    fn get_global(&self, id: GlobalId) -> Result<&Global<D>, InvalidId> {
        self.globals.iter().find(|global| global.id == id).ok_or(InvalidId)
    }

    pub(crate) fn get_info(&self, id: GlobalId) -> Result<GlobalInfo, InvalidId> {
        let global = self.get_global(id)?;
        Ok(GlobalInfo { interface: global.interface, version: global.version })
    }

    pub(crate) fn get_handler(&self, id: GlobalId) -> Result<Arc<dyn GlobalHandler<D>>, InvalidId> {
        let global = self.get_global(id)?;
        Ok(global.handler.clone())
    }

    pub(crate) fn check_bind(
        &self,
        client: ClientId,
        name: u32,
        interface_name: &str,
        version: u32,
    ) -> Result<(&'static Interface, GlobalId, Arc<dyn GlobalHandler<D>>), BindError> {
        let global = self
            .globals
            .iter()
            .find(|global| global.id.name == name)
            .ok_or(BindError::Invalid)?;
        if global.interface.name != interface_name {
            return Err(BindError::Invalid);
        }
        if global.version < version {
            return Err(BindError::Version { have: global.version });
        }
        if !global.handler.can_view(client, global.id) {
            return Err(BindError::Invalid);
        }

        Ok((global.interface, global.id, global.handler.clone()))
    }

    /// Broadcast `global_remove`, then unlink the global.
    ///
    /// In-flight binds that were already dispatched are not affected.
    pub(crate) fn remove_global(&mut self, id: GlobalId, clients: &mut ClientStore<D>) {
        if let Ok(global) = self.get_global(id) {
            for registry in self.known_registries.iter().cloned().collect::<Vec<_>>() {
                if let Ok(client) = clients.get_client_mut(registry.client_id.clone()) {
                    if global.handler.can_view(client.id.clone(), global.id) {
                        let _ = send_global_remove_to(client, global, registry);
                    }
                }
            }
        }
        self.globals.retain(|global| global.id != id);
    }

    /// Record a freshly bound registry resource and replay the current
    /// global list to it.
    pub(crate) fn new_registry(
        &mut self,
        registry: ObjectId,
        client: &mut Client<D>,
    ) -> Result<(), SendError> {
        for global in &self.globals {
            if global.handler.can_view(client.id.clone(), global.id) {
                // fail the whole replay on error, there is no point in
                // trying further on a failing client
                send_global_to(client, global, registry.clone())?;
            }
        }
        self.known_registries.push(registry);
        Ok(())
    }

    pub(crate) fn cleanup(&mut self, dead_clients: &[ClientId]) {
        self.known_registries.retain(|obj_id| !dead_clients.contains(&obj_id.client_id));
    }
}

fn send_global_to<D>(
    client: &mut Client<D>,
    global: &Global<D>,
    registry: ObjectId,
) -> Result<(), SendError> {
    client.send_event(
        message!(
            registry,
            wl_registry::EVT_GLOBAL,
            [
                Argument::Uint(global.id.name),
                Argument::Str(Some(Box::new(CString::new(global.interface.name).unwrap()))),
                Argument::Uint(global.version),
            ],
        ),
        // not a destructor, this argument is not used
        None,
    )
}

fn send_global_remove_to<D>(
    client: &mut Client<D>,
    global: &Global<D>,
    registry: ObjectId,
) -> Result<(), SendError> {
    client.send_event(
        message!(registry, wl_registry::EVT_GLOBAL_REMOVE, [Argument::Uint(global.id.name)]),
        None,
    )
}
