//! Per-client object map.
//!
//! Object ids live in two disjoint ranges: ids from 1 up to
//! [`SERVER_ID_LIMIT`] (excluded) are allocated by the client, ids
//! from [`SERVER_ID_LIMIT`] up are allocated by the server. Each range
//! is backed by a dense vector grown on demand.
//!
//! Freeing a client-allocated id leaves a `None` slot behind (the
//! zombie): the id stays unusable until the client, having seen the
//! corresponding `delete_id` event, re-uses it — which is what
//! [`ObjectMap::insert_at`] over a `None` slot implements.

use waycore_protocol::protocol::Interface;

use std::cmp::Ordering;

/// Limit separating server-created from client-created objects ids in the namespace
pub const SERVER_ID_LIMIT: u32 = 0xFF00_0000;

bitflags::bitflags! {
    /// Per-entry flags of the object map.
    pub struct ObjectFlags: u32 {
        /// The object predates the per-object dispatcher: requests go
        /// through its interface vtable and no since-version check is
        /// applied to it.
        const LEGACY = 0x01;
    }
}

/// The representation of a protocol object
#[derive(Clone, Debug)]
pub struct Object<Data> {
    /// Interface of this object
    pub interface: &'static Interface,
    /// Version of this object
    pub version: u32,
    /// Map-entry flags of this object
    pub flags: ObjectFlags,
    /// Data associated to this object
    pub data: Data,
}

/// A holder for the object store of a connection
///
/// Keeps track of which object id is associated to which interface
/// object, and which is currently unused.
#[derive(Default, Debug)]
pub struct ObjectMap<Data> {
    client_objects: Vec<Option<Object<Data>>>,
    server_objects: Vec<Option<Object<Data>>>,
}

impl<Data: Clone> ObjectMap<Data> {
    /// Create a new empty object map
    pub fn new() -> Self {
        Self { client_objects: Vec::new(), server_objects: Vec::new() }
    }

    /// Find an object in the store
    pub fn find(&self, id: u32) -> Option<Object<Data>> {
        if id == 0 {
            None
        } else if id >= SERVER_ID_LIMIT {
            self.server_objects.get((id - SERVER_ID_LIMIT) as usize).and_then(Clone::clone)
        } else {
            self.client_objects.get((id - 1) as usize).and_then(Clone::clone)
        }
    }

    /// Flags of the entry for an object, if it is live
    pub fn flags(&self, id: u32) -> Option<ObjectFlags> {
        self.find(id).map(|obj| obj.flags)
    }

    /// Remove an object from the store
    ///
    /// The slot is left as a zombie; it does nothing if the object
    /// didn't previously exist.
    pub fn remove(&mut self, id: u32) {
        if id == 0 {
            // nothing
        } else if id >= SERVER_ID_LIMIT {
            if let Some(place) = self.server_objects.get_mut((id - SERVER_ID_LIMIT) as usize) {
                *place = None;
            }
        } else if let Some(place) = self.client_objects.get_mut((id - 1) as usize) {
            *place = None;
        }
    }

    /// Insert given object for given id
    ///
    /// Can fail if the requested id is already live, or if it is
    /// further ahead than the next free id of its range (in which case
    /// this is a protocol error). Re-using a zombie slot succeeds: the
    /// client only does so once it has acknowledged the deletion.
    #[allow(clippy::result_unit_err)]
    pub fn insert_at(&mut self, id: u32, object: Object<Data>) -> Result<(), ()> {
        if id == 0 {
            Err(())
        } else if id >= SERVER_ID_LIMIT {
            insert_in_at(&mut self.server_objects, (id - SERVER_ID_LIMIT) as usize, object)
        } else {
            insert_in_at(&mut self.client_objects, (id - 1) as usize, object)
        }
    }

    /// Allocate a new id for an object in the client namespace
    pub fn client_insert_new(&mut self, object: Object<Data>) -> u32 {
        insert_in(&mut self.client_objects, object) + 1
    }

    /// Allocate a new id for an object in the server namespace
    pub fn server_insert_new(&mut self, object: Object<Data>) -> u32 {
        insert_in(&mut self.server_objects, object) + SERVER_ID_LIMIT
    }

    /// Mutably access an object of the map
    #[allow(clippy::result_unit_err)]
    pub fn with<T, F: FnOnce(&mut Object<Data>) -> T>(&mut self, id: u32, f: F) -> Result<T, ()> {
        if id == 0 {
            Err(())
        } else if id >= SERVER_ID_LIMIT {
            if let Some(&mut Some(ref mut obj)) =
                self.server_objects.get_mut((id - SERVER_ID_LIMIT) as usize)
            {
                Ok(f(obj))
            } else {
                Err(())
            }
        } else if let Some(&mut Some(ref mut obj)) = self.client_objects.get_mut((id - 1) as usize)
        {
            Ok(f(obj))
        } else {
            Err(())
        }
    }

    /// Iterate over all objects of the map, ascending id order, the
    /// client range first
    pub fn all_objects(&self) -> impl Iterator<Item = (u32, &Object<Data>)> {
        let client_side_iter = self
            .client_objects
            .iter()
            .enumerate()
            .flat_map(|(idx, place)| place.as_ref().map(|obj| (idx as u32 + 1, obj)));

        let server_side_iter = self
            .server_objects
            .iter()
            .enumerate()
            .flat_map(|(idx, place)| place.as_ref().map(|obj| (idx as u32 + SERVER_ID_LIMIT, obj)));

        client_side_iter.chain(server_side_iter)
    }
}

// insert a new object in a store at the first free place
fn insert_in<Data>(store: &mut Vec<Option<Object<Data>>>, object: Object<Data>) -> u32 {
    match store.iter().position(Option::is_none) {
        Some(id) => {
            store[id] = Some(object);
            id as u32
        }
        None => {
            store.push(Some(object));
            (store.len() - 1) as u32
        }
    }
}

// insert an object at a given place in a store
fn insert_in_at<Data>(
    store: &mut Vec<Option<Object<Data>>>,
    id: usize,
    object: Object<Data>,
) -> Result<(), ()> {
    match id.cmp(&store.len()) {
        Ordering::Greater => Err(()),
        Ordering::Equal => {
            store.push(Some(object));
            Ok(())
        }
        Ordering::Less => {
            let previous = &mut store[id];
            if previous.is_some() {
                return Err(());
            }
            *previous = Some(object);
            Ok(())
        }
    }
}
