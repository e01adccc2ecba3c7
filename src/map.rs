//! Id allocation and storage of protocol objects

use crate::protocol::Interface;

/// First id of the range allocated by servers
pub const SERVER_ID_LIMIT: u32 = 0xFF00_0000;

/// Lifecycle of an object held in the map
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// The object can send and receive messages
    Alive,
    /// The object was destroyed but its id has not been released yet
    Zombie,
}

/// A protocol object, as stored in the map
#[derive(Debug, Clone)]
pub struct Object<Data> {
    /// Interface of the object
    pub interface: &'static Interface,
    /// Version the object was created with
    pub version: u32,
    /// Whether the object is still alive
    pub state: Lifecycle,
    /// Data associated to this object (handler, serial...)
    pub data: Data,
}

impl<Data> Object<Data> {
    /// Create a new living object
    pub fn new(interface: &'static Interface, version: u32, data: Data) -> Self {
        Self { interface, version, state: Lifecycle::Alive, data }
    }

    /// Whether the object is a zombie
    pub fn is_zombie(&self) -> bool {
        self.state == Lifecycle::Zombie
    }
}

/// Failure to register an object at a given id
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum InsertError {
    /// The null id cannot hold an object
    #[error("id 0 is reserved")]
    NullId,
    /// The id is held by a living object or a zombie
    #[error("id {0} is already in use")]
    Occupied(u32),
    /// The id leaves a gap after the last allocated id of its range
    #[error("id {0} is not the next free id")]
    OutOfSequence(u32),
    /// The id belongs to the range allocated by the other side of the connection
    #[error("id {0} is outside of the range the peer allocates from")]
    ForeignRange(u32),
}

// One of the two id ranges, slot `i` holds the object of id `first + i`
#[derive(Debug)]
struct IdRange<Data> {
    first: u32,
    slots: Vec<Option<Object<Data>>>,
}

impl<Data> IdRange<Data> {
    const fn new(first: u32) -> Self {
        Self { first, slots: Vec::new() }
    }

    fn index(&self, id: u32) -> usize {
        (id - self.first) as usize
    }

    fn get(&self, id: u32) -> Option<&Object<Data>> {
        self.slots.get(self.index(id))?.as_ref()
    }

    fn get_mut(&mut self, id: u32) -> Option<&mut Option<Object<Data>>> {
        let index = self.index(id);
        self.slots.get_mut(index)
    }

    // lowest free id
    fn allocate(&mut self, object: Object<Data>) -> u32 {
        let index = match self.slots.iter().position(Option::is_none) {
            Some(index) => {
                self.slots[index] = Some(object);
                index
            }
            None => {
                self.slots.push(Some(object));
                self.slots.len() - 1
            }
        };
        self.first + index as u32
    }

    fn insert_at(&mut self, id: u32, object: Object<Data>) -> Result<(), InsertError> {
        let index = self.index(id);
        let len = self.slots.len();
        match self.slots.get_mut(index) {
            Some(Some(_)) => Err(InsertError::Occupied(id)),
            Some(slot) => {
                *slot = Some(object);
                Ok(())
            }
            None if index == len => {
                self.slots.push(Some(object));
                Ok(())
            }
            None => Err(InsertError::OutOfSequence(id)),
        }
    }

    fn iter(&self) -> impl Iterator<Item = (u32, &Object<Data>)> {
        let first = self.first;
        self.slots
            .iter()
            .enumerate()
            .filter_map(move |(index, slot)| Some((first + index as u32, slot.as_ref()?)))
    }

    fn drain(&mut self) -> impl Iterator<Item = (u32, Object<Data>)> {
        let first = self.first;
        std::mem::take(&mut self.slots)
            .into_iter()
            .enumerate()
            .filter_map(move |(index, slot)| Some((first + index as u32, slot?)))
    }
}

/// Objects of a connection, indexed by their protocol id
///
/// Ids below [`SERVER_ID_LIMIT`] are allocated by the client starting from 1, the
/// others by the server starting from the limit. Each side reuses the lowest free id of
/// its range. A destroyed object may stay in the map as a zombie, keeping its id
/// reserved until the peer acknowledges the destruction.
#[derive(Debug)]
pub struct ObjectMap<Data> {
    client_range: IdRange<Data>,
    server_range: IdRange<Data>,
}

impl<Data> Default for ObjectMap<Data> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Data> ObjectMap<Data> {
    /// An empty map
    pub fn new() -> Self {
        Self { client_range: IdRange::new(1), server_range: IdRange::new(SERVER_ID_LIMIT) }
    }

    fn range(&self, id: u32) -> Option<&IdRange<Data>> {
        match id {
            0 => None,
            SERVER_ID_LIMIT.. => Some(&self.server_range),
            _ => Some(&self.client_range),
        }
    }

    fn range_mut(&mut self, id: u32) -> Option<&mut IdRange<Data>> {
        match id {
            0 => None,
            SERVER_ID_LIMIT.. => Some(&mut self.server_range),
            _ => Some(&mut self.client_range),
        }
    }

    /// The living object of this id
    pub fn find(&self, id: u32) -> Option<&Object<Data>> {
        self.find_any(id).filter(|obj| !obj.is_zombie())
    }

    /// The object of this id, zombie or not
    pub fn find_any(&self, id: u32) -> Option<&Object<Data>> {
        self.range(id)?.get(id)
    }

    /// Turn the object into a zombie, `false` if the id is free
    pub fn mark_zombie(&mut self, id: u32) -> bool {
        self.with(id, |obj| obj.state = Lifecycle::Zombie).is_some()
    }

    /// Free the id, returning the object that held it
    pub fn remove(&mut self, id: u32) -> Option<Object<Data>> {
        self.range_mut(id)?.get_mut(id)?.take()
    }

    /// Register an object at an id chosen by the peer
    ///
    /// The id must be free (zombies hold their id) and must not leave a gap after the
    /// highest id of its range.
    pub fn insert_at(&mut self, id: u32, object: Object<Data>) -> Result<(), InsertError> {
        self.range_mut(id).ok_or(InsertError::NullId)?.insert_at(id, object)
    }

    /// Register an object at the lowest free client id
    pub fn client_insert_new(&mut self, object: Object<Data>) -> u32 {
        self.client_range.allocate(object)
    }

    /// Register an object at the lowest free server id
    pub fn server_insert_new(&mut self, object: Object<Data>) -> u32 {
        self.server_range.allocate(object)
    }

    /// Run `f` on the object of this id, zombies included
    pub fn with<T, F: FnOnce(&mut Object<Data>) -> T>(&mut self, id: u32, f: F) -> Option<T> {
        let obj = self.range_mut(id)?.get_mut(id)?.as_mut()?;
        Some(f(obj))
    }

    /// Every object of the map with its id, zombies included
    pub fn all_objects(&self) -> impl Iterator<Item = (u32, &Object<Data>)> {
        self.client_range.iter().chain(self.server_range.iter())
    }

    /// Empty the map, returning its objects with their ids
    pub fn clear(&mut self) -> Vec<(u32, Object<Data>)> {
        let mut objects = self.client_range.drain().collect::<Vec<_>>();
        objects.extend(self.server_range.drain());
        objects
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ANONYMOUS_INTERFACE;

    fn obj(tag: u32) -> Object<u32> {
        Object::new(&ANONYMOUS_INTERFACE, 1, tag)
    }

    #[test]
    fn null_id_never_resolves() {
        let mut map = ObjectMap::new();
        assert_eq!(map.insert_at(0, obj(0)), Err(InsertError::NullId));
        assert!(map.find(0).is_none());
        assert!(map.find_any(0).is_none());
        assert!(!map.mark_zombie(0));
        assert!(map.remove(0).is_none());
    }

    #[test]
    fn allocation_skips_zombies() {
        let mut map = ObjectMap::new();
        assert_eq!(map.client_insert_new(obj(1)), 1);
        assert_eq!(map.client_insert_new(obj(2)), 2);
        assert_eq!(map.client_insert_new(obj(3)), 3);

        assert!(map.mark_zombie(2));
        assert!(map.find(2).is_none());
        assert_eq!(map.find_any(2).map(|o| o.data), Some(2));
        // the zombie keeps its id reserved
        assert_eq!(map.client_insert_new(obj(4)), 4);

        // once released, the lowest free id is reused
        assert_eq!(map.remove(2).map(|o| o.data), Some(2));
        assert!(map.find_any(2).is_none());
        assert_eq!(map.client_insert_new(obj(5)), 2);
        assert_eq!(map.find(2).map(|o| o.data), Some(5));
    }

    #[test]
    fn server_range() {
        let mut map = ObjectMap::new();
        assert_eq!(map.server_insert_new(obj(1)), SERVER_ID_LIMIT);
        assert_eq!(map.server_insert_new(obj(2)), SERVER_ID_LIMIT + 1);
        assert_eq!(map.find(SERVER_ID_LIMIT + 1).map(|o| o.data), Some(2));
        assert!(map.find(1).is_none());
    }

    #[test]
    fn insert_at_rules() {
        let mut map = ObjectMap::new();
        assert_eq!(map.insert_at(1, obj(1)), Ok(()));
        assert_eq!(map.insert_at(1, obj(1)), Err(InsertError::Occupied(1)));
        assert_eq!(map.insert_at(5, obj(5)), Err(InsertError::OutOfSequence(5)));
        assert_eq!(map.insert_at(2, obj(2)), Ok(()));

        map.mark_zombie(2);
        assert_eq!(map.insert_at(2, obj(3)), Err(InsertError::Occupied(2)));
        map.remove(2);
        assert_eq!(map.insert_at(2, obj(3)), Ok(()));

        assert_eq!(map.insert_at(SERVER_ID_LIMIT, obj(6)), Ok(()));
        assert_eq!(
            map.insert_at(SERVER_ID_LIMIT + 3, obj(7)),
            Err(InsertError::OutOfSequence(SERVER_ID_LIMIT + 3))
        );
    }

    #[test]
    fn ids_stay_unique() {
        // interleave allocations, registrations, zombification and releases,
        // and check no id ever resolves to two objects or to a released one
        let mut map = ObjectMap::new();
        let mut live = std::collections::HashMap::new();
        let mut tag = 0;
        for round in 0..200u32 {
            tag += 1;
            match round % 5 {
                0 | 1 => {
                    let id = map.client_insert_new(obj(tag));
                    assert!(live.insert(id, tag).is_none());
                }
                2 => {
                    let id = map.server_insert_new(obj(tag));
                    assert!(live.insert(id, tag).is_none());
                }
                3 => {
                    if let Some(&id) = live.keys().min() {
                        map.mark_zombie(id);
                        live.remove(&id);
                    }
                }
                _ => {
                    let zombies: Vec<u32> = map
                        .all_objects()
                        .filter(|(_, o)| o.is_zombie())
                        .map(|(id, _)| id)
                        .collect();
                    for id in zombies {
                        map.remove(id);
                        assert!(map.find(id).is_none());
                    }
                }
            }
            for (id, o) in map.all_objects() {
                match live.get(&id) {
                    Some(&t) => assert_eq!(o.data, t),
                    None => assert!(o.is_zombie()),
                }
            }
            for (&id, &t) in &live {
                assert_eq!(map.find(id).map(|o| o.data), Some(t));
            }
        }
    }

    #[test]
    fn clear_drains_everything() {
        let mut map = ObjectMap::new();
        map.client_insert_new(obj(1));
        map.server_insert_new(obj(2));
        map.mark_zombie(1);
        let drained = map.clear();
        assert_eq!(drained.len(), 2);
        assert_eq!(map.all_objects().count(), 0);
    }
}
