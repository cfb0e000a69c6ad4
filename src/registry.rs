use ahash::{HashMap, HashMapExt};

use crate::error::{Error, Result};
use crate::event::{Descriptor, Interest, Token};

///
/// Stable address of a registration.
///
/// Packs into the user-data slot of OS event records. A key whose generation
/// no longer matches its slot belongs to a removed or re-keyed registration
/// and resolves to nothing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct Key {
    index: u32,
    generation: u32,
}

impl Key {
    pub(crate) fn as_u64(self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.index)
    }

    pub(crate) fn from_u64(raw: u64) -> Key {
        Key {
            index: raw as u32,
            generation: (raw >> 32) as u32,
        }
    }

    /// Packs into a pointer-sized slot, for kqueue udata and IOCP
    /// completion keys.
    ///
    /// On 32-bit targets the generation is cut to its low 8 bits, which
    /// still rejects records of the last 255 registrations of a slot.
    #[cfg_attr(any(target_os = "linux", target_os = "android", target_os = "illumos"), allow(dead_code))]
    pub(crate) fn as_usize(self) -> usize {
        #[cfg(target_pointer_width = "64")]
        {
            self.as_u64() as usize
        }
        #[cfg(not(target_pointer_width = "64"))]
        {
            ((self.generation as usize & 0xff) << 24) | (self.index as usize & 0x00ff_ffff)
        }
    }

    #[cfg_attr(any(target_os = "linux", target_os = "android", target_os = "illumos"), allow(dead_code))]
    pub(crate) fn from_usize(raw: usize) -> Key {
        #[cfg(target_pointer_width = "64")]
        {
            Key::from_u64(raw as u64)
        }
        #[cfg(not(target_pointer_width = "64"))]
        {
            Key {
                index: (raw & 0x00ff_ffff) as u32,
                generation: (raw >> 24) as u32,
            }
        }
    }

    fn matches(self, generation: u32) -> bool {
        #[cfg(target_pointer_width = "64")]
        {
            self.generation == generation
        }
        #[cfg(not(target_pointer_width = "64"))]
        {
            self.generation & 0xff == generation & 0xff
        }
    }
}

///
/// Metadata of one registered descriptor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct DescriptorEntry {
    pub(crate) descriptor: Descriptor,
    pub(crate) interest: Interest,
    pub(crate) token: Token,
    /// Backend specific: the OS-side registration was consumed and must be
    /// resubmitted before the descriptor can signal again.
    #[cfg_attr(not(all(target_os = "linux", feature = "iouring")), allow(dead_code))]
    pub(crate) rearm: bool,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    entry: Option<DescriptorEntry>,
}

///
/// Descriptor metadata store.
///
/// Entries live in a generational slab; the map only serves lookups by
/// descriptor value for `modify` and `remove`.
#[derive(Debug)]
pub(crate) struct Registry {
    slots: Vec<Slot>,
    free: Vec<u32>,
    index: HashMap<Descriptor, u32>,
}

impl Registry {
    pub(crate) fn with_capacity(capacity: usize) -> Registry {
        Registry {
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            index: HashMap::with_capacity(capacity),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.index.len()
    }

    pub(crate) fn contains(&self, descriptor: Descriptor) -> bool {
        self.index.contains_key(&descriptor)
    }

    pub(crate) fn insert(
        &mut self,
        descriptor: Descriptor,
        interest: Interest,
        token: Token,
    ) -> Result<Key> {
        if self.contains(descriptor) {
            return Err(Error::AlreadyRegistered(descriptor));
        }

        let entry = DescriptorEntry {
            descriptor,
            interest,
            token,
            rearm: false,
        };

        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index as usize].entry = Some(entry);
                index
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    entry: Some(entry),
                });
                index
            }
        };
        self.index.insert(descriptor, index);

        Ok(Key {
            index,
            generation: self.slots[index as usize].generation,
        })
    }

    pub(crate) fn key_of(&self, descriptor: Descriptor) -> Option<Key> {
        self.index.get(&descriptor).map(|&index| Key {
            index,
            generation: self.slots[index as usize].generation,
        })
    }

    pub(crate) fn get(&self, key: Key) -> Option<&DescriptorEntry> {
        self.slots
            .get(key.index as usize)
            .filter(|slot| key.matches(slot.generation))
            .and_then(|slot| slot.entry.as_ref())
    }

    pub(crate) fn get_mut(&mut self, key: Key) -> Option<&mut DescriptorEntry> {
        self.slots
            .get_mut(key.index as usize)
            .filter(|slot| key.matches(slot.generation))
            .and_then(|slot| slot.entry.as_mut())
    }

    pub(crate) fn lookup_mut(&mut self, descriptor: Descriptor) -> Option<&mut DescriptorEntry> {
        let key = self.key_of(descriptor)?;
        self.get_mut(key)
    }

    /// Moves the registration to a fresh generation of the same slot.
    ///
    /// Keys handed out before the call become stale.
    #[cfg_attr(not(all(target_os = "linux", feature = "iouring")), allow(dead_code))]
    pub(crate) fn rekey(&mut self, descriptor: Descriptor) -> Result<Key> {
        let index = *self
            .index
            .get(&descriptor)
            .ok_or(Error::NotRegistered(descriptor))?;
        let slot = &mut self.slots[index as usize];
        slot.generation = slot.generation.wrapping_add(1);

        Ok(Key {
            index,
            generation: slot.generation,
        })
    }

    pub(crate) fn remove(&mut self, descriptor: Descriptor) -> Result<DescriptorEntry> {
        let index = self
            .index
            .remove(&descriptor)
            .ok_or(Error::NotRegistered(descriptor))?;
        let slot = &mut self.slots[index as usize];
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(index);

        slot.entry.take().ok_or(Error::NotRegistered(descriptor))
    }

    /// Entries with their current keys, in slot order.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (Key, &DescriptorEntry)> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.entry.as_ref().map(|entry| {
                (
                    Key {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    entry,
                )
            })
        })
    }
}
