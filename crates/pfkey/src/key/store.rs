//! Keyed index store.
//!
//! Every database collection (policies per direction, SAIdx entries per
//! direction, SAs per state) is a [`List`] threaded through a shared
//! [`Arena`]. Entries are addressed by generation-checked [`Key`]s, so a
//! key held after its entry was removed simply stops resolving instead of
//! pointing at a reused slot.
//!
//! ```
//! use pfkey::key::store::Arena;
//!
//! let mut arena = Arena::new();
//! let mut list = arena.new_list();
//! let a = arena.insert("a");
//! let b = arena.insert("b");
//! arena.push_back(&mut list, a).unwrap();
//! arena.link(&mut list, None, b).unwrap();
//!
//! let order: Vec<_> = arena.iter(&list).map(|(_, v)| *v).collect();
//! assert_eq!(order, ["b", "a"]);
//! assert_eq!(list.len(), 2);
//! ```

use super::error::{Error, Result};

/// Generation-checked handle to an arena entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key {
    index: u32,
    generation: u32,
}

/// Identity of a [`List`] within its arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListId(u32);

/// A doubly-linked collection of arena entries with O(1) length.
#[derive(Debug)]
pub struct List {
    id: ListId,
    head: Option<u32>,
    tail: Option<u32>,
    len: usize,
}

impl List {
    /// Number of linked entries.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the list has no entries.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The list's identity.
    pub fn id(&self) -> ListId {
        self.id
    }
}

#[derive(Debug)]
struct Node<T> {
    value: T,
    prev: Option<u32>,
    next: Option<u32>,
    owner: Option<ListId>,
}

#[derive(Debug)]
enum Slot<T> {
    Occupied { generation: u32, node: Node<T> },
    Vacant { generation: u32, next_free: Option<u32> },
}

/// Slot storage shared by a family of lists.
#[derive(Debug)]
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Option<u32>,
    len: usize,
    next_list: u32,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Arena<T> {
    /// Create an empty arena.
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: None,
            len: 0,
            next_list: 0,
        }
    }

    /// Create a new, empty list bound to this arena.
    pub fn new_list(&mut self) -> List {
        let id = ListId(self.next_list);
        self.next_list += 1;
        List {
            id,
            head: None,
            tail: None,
            len: 0,
        }
    }

    /// Number of live entries, linked or not.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the arena holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Store a value. The new entry is not a member of any list.
    pub fn insert(&mut self, value: T) -> Key {
        let node = Node {
            value,
            prev: None,
            next: None,
            owner: None,
        };
        self.len += 1;
        match self.free {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                let (generation, next_free) = match slot {
                    Slot::Vacant {
                        generation,
                        next_free,
                    } => (generation.wrapping_add(1), *next_free),
                    Slot::Occupied { .. } => unreachable!("free list points at an occupied slot"),
                };
                self.free = next_free;
                *slot = Slot::Occupied { generation, node };
                Key { index, generation }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot::Occupied {
                    generation: 0,
                    node,
                });
                Key {
                    index,
                    generation: 0,
                }
            }
        }
    }

    /// Whether `key` still refers to a live entry.
    pub fn contains(&self, key: Key) -> bool {
        self.node(key).is_some()
    }

    /// Borrow the value behind `key`.
    pub fn get(&self, key: Key) -> Option<&T> {
        self.node(key).map(|n| &n.value)
    }

    /// Mutably borrow the value behind `key`.
    pub fn get_mut(&mut self, key: Key) -> Option<&mut T> {
        self.node_mut(key).map(|n| &mut n.value)
    }

    /// The list `key` is currently linked into, if any.
    pub fn owner(&self, key: Key) -> Option<ListId> {
        self.node(key).and_then(|n| n.owner)
    }

    /// Link `key` into `list`, at the head when `after` is `None`,
    /// otherwise directly after `after`.
    pub fn link(&mut self, list: &mut List, after: Option<Key>, key: Key) -> Result<()> {
        let owner = self
            .node(key)
            .ok_or(Error::Corrupted("link of a stale key"))?
            .owner;
        if owner.is_some() {
            debug_assert!(false, "entry is already linked");
            return Err(Error::Corrupted("entry is already linked"));
        }

        let (prev, next) = match after {
            None => (None, list.head),
            Some(after) => {
                let anchor = self
                    .node(after)
                    .ok_or(Error::Corrupted("link after a stale key"))?;
                if anchor.owner != Some(list.id) {
                    debug_assert!(false, "anchor is not in the target list");
                    return Err(Error::Corrupted("anchor is not in the target list"));
                }
                (Some(after.index), anchor.next)
            }
        };

        match prev {
            Some(p) => self.node_at_mut(p).next = Some(key.index),
            None => list.head = Some(key.index),
        }
        match next {
            Some(n) => self.node_at_mut(n).prev = Some(key.index),
            None => list.tail = Some(key.index),
        }

        let node = self.node_at_mut(key.index);
        node.prev = prev;
        node.next = next;
        node.owner = Some(list.id);
        list.len += 1;
        Ok(())
    }

    /// Append `key` to the end of `list`.
    pub fn push_back(&mut self, list: &mut List, key: Key) -> Result<()> {
        let tail = list.tail.map(|index| self.key_at(index));
        self.link(list, tail, key)
    }

    /// Remove `key` from `list` in O(1). The entry stays in the arena.
    pub fn unlink(&mut self, list: &mut List, key: Key) -> Result<()> {
        let node = self
            .node(key)
            .ok_or(Error::Corrupted("unlink of a stale key"))?;
        if node.owner != Some(list.id) {
            debug_assert!(false, "entry is not a member of this list");
            return Err(Error::Corrupted("entry is not a member of this list"));
        }
        let (prev, next) = (node.prev, node.next);

        match prev {
            Some(p) => self.node_at_mut(p).next = next,
            None => list.head = next,
        }
        match next {
            Some(n) => self.node_at_mut(n).prev = prev,
            None => list.tail = prev,
        }

        let node = self.node_at_mut(key.index);
        node.prev = None;
        node.next = None;
        node.owner = None;
        list.len -= 1;
        Ok(())
    }

    /// Take an unlinked entry out of the arena.
    pub fn remove(&mut self, key: Key) -> Result<T> {
        let node = self
            .node(key)
            .ok_or(Error::Corrupted("remove of a stale key"))?;
        if node.owner.is_some() {
            debug_assert!(false, "removing an entry that is still linked");
            return Err(Error::Corrupted("removing an entry that is still linked"));
        }

        let vacant = Slot::Vacant {
            generation: key.generation,
            next_free: self.free,
        };
        let slot = std::mem::replace(&mut self.slots[key.index as usize], vacant);
        self.free = Some(key.index);
        self.len -= 1;
        match slot {
            Slot::Occupied { node, .. } => Ok(node.value),
            Slot::Vacant { .. } => Err(Error::Corrupted("remove of a vacant slot")),
        }
    }

    /// Iterate a list in link order.
    pub fn iter<'a>(&'a self, list: &List) -> Iter<'a, T> {
        Iter {
            arena: self,
            cursor: list.head,
        }
    }

    /// Snapshot of a list's keys, for passes that mutate while walking.
    pub fn keys(&self, list: &List) -> Vec<Key> {
        self.iter(list).map(|(k, _)| k).collect()
    }

    fn node(&self, key: Key) -> Option<&Node<T>> {
        match self.slots.get(key.index as usize)? {
            Slot::Occupied { generation, node } if *generation == key.generation => Some(node),
            _ => None,
        }
    }

    fn node_mut(&mut self, key: Key) -> Option<&mut Node<T>> {
        match self.slots.get_mut(key.index as usize)? {
            Slot::Occupied { generation, node } if *generation == key.generation => Some(node),
            _ => None,
        }
    }

    // Linked indices always refer to occupied slots: remove() refuses
    // linked entries.
    fn node_at_mut(&mut self, index: u32) -> &mut Node<T> {
        match &mut self.slots[index as usize] {
            Slot::Occupied { node, .. } => node,
            Slot::Vacant { .. } => unreachable!("linked index refers to a vacant slot"),
        }
    }

    fn key_at(&self, index: u32) -> Key {
        match &self.slots[index as usize] {
            Slot::Occupied { generation, .. } => Key {
                index,
                generation: *generation,
            },
            Slot::Vacant { .. } => unreachable!("linked index refers to a vacant slot"),
        }
    }
}

/// Iterator over `(key, value)` pairs of a list.
pub struct Iter<'a, T> {
    arena: &'a Arena<T>,
    cursor: Option<u32>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = (Key, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.cursor?;
        match &self.arena.slots[index as usize] {
            Slot::Occupied { generation, node } => {
                self.cursor = node.next;
                Some((
                    Key {
                        index,
                        generation: *generation,
                    },
                    &node.value,
                ))
            }
            Slot::Vacant { .. } => None,
        }
    }
}
