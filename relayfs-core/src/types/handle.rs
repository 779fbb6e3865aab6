//! Opaque handles and the generation-checked table that owns the resources
//! behind them.
//!
//! A handle packs a slot index (low 32 bits) with the slot's generation (high
//! 32 bits). Releasing a handle bumps the generation, so a stale handle never
//! reaches whatever later reuses its slot.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{RelayError, Result};

/// Conversion between a typed handle and the raw integer the bridge carries.
pub trait RawHandle: Copy + fmt::Debug {
    fn from_raw(raw: u64) -> Self;
    fn raw(self) -> u64;
}

/// A handle to an open backing file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileHandle(u64);

/// A handle to an open directory stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DirHandle(u64);

impl RawHandle for FileHandle {
    fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    fn raw(self) -> u64 {
        self.0
    }
}

impl RawHandle for DirHandle {
    fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileHandle({:#x})", self.0)
    }
}

impl fmt::Display for DirHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DirHandle({:#x})", self.0)
    }
}

fn encode(index: u32, generation: u32) -> u64 {
    (u64::from(generation) << 32) | u64::from(index)
}

fn decode(raw: u64) -> (u32, u32) {
    (raw as u32, (raw >> 32) as u32)
}

struct Slot<T> {
    generation: u32,
    value: Option<Arc<T>>,
}

struct Slots<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    live: usize,
}

/// Arena of live resources addressed by typed handles.
///
/// Lookups hand out an `Arc` so that calls on one handle never hold the table
/// lock while the backing call runs.
pub struct HandleTable<H, T> {
    inner: RwLock<Slots<T>>,
    _handle: PhantomData<fn() -> H>,
}

impl<H: RawHandle, T> HandleTable<H, T> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Slots {
                slots: Vec::new(),
                free: Vec::new(),
                live: 0,
            }),
            _handle: PhantomData,
        }
    }

    /// Takes ownership of `value` and issues a fresh handle for it.
    ///
    /// On failure `value` is dropped here, which closes whatever it owns.
    pub fn insert(&self, value: T) -> Result<H> {
        let mut inner = self.inner.write();
        let index = match inner.free.pop() {
            Some(index) => index,
            None => {
                let index = u32::try_from(inner.slots.len()).map_err(|_| RelayError::OutOfMemory)?;
                inner.slots.try_reserve(1).map_err(|_| RelayError::OutOfMemory)?;
                inner.slots.push(Slot {
                    generation: 1,
                    value: None,
                });
                index
            }
        };
        let slot = &mut inner.slots[index as usize];
        slot.value = Some(Arc::new(value));
        let raw = encode(index, slot.generation);
        inner.live += 1;
        Ok(H::from_raw(raw))
    }

    /// Borrows the resource behind `handle`.
    pub fn get(&self, handle: H) -> Result<Arc<T>> {
        let (index, generation) = decode(handle.raw());
        let inner = self.inner.read();
        inner
            .slots
            .get(index as usize)
            .filter(|slot| slot.generation == generation)
            .and_then(|slot| slot.value.clone())
            .ok_or(RelayError::InvalidHandle(handle.raw()))
    }

    /// Invalidates `handle` and returns its resource.
    pub fn remove(&self, handle: H) -> Result<Arc<T>> {
        let (index, generation) = decode(handle.raw());
        let mut inner = self.inner.write();
        let slot = inner
            .slots
            .get_mut(index as usize)
            .filter(|slot| slot.generation == generation)
            .ok_or(RelayError::InvalidHandle(handle.raw()))?;
        let value = slot.value.take().ok_or(RelayError::InvalidHandle(handle.raw()))?;
        slot.generation = match slot.generation.wrapping_add(1) {
            0 => 1,
            next => next,
        };
        inner.free.push(index);
        inner.live -= 1;
        Ok(value)
    }

    /// Invalidates every handle and returns the resources that were live.
    pub fn drain(&self) -> Vec<Arc<T>> {
        let mut inner = self.inner.write();
        let mut drained = Vec::with_capacity(inner.live);
        let Slots { slots, free, live } = &mut *inner;
        for (index, slot) in slots.iter_mut().enumerate() {
            if let Some(value) = slot.value.take() {
                slot.generation = match slot.generation.wrapping_add(1) {
                    0 => 1,
                    next => next,
                };
                free.push(index as u32);
                drained.push(value);
            }
        }
        *live = 0;
        drained
    }

    /// Number of live handles.
    pub fn len(&self) -> usize {
        self.inner.read().live
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<H: RawHandle, T> Default for HandleTable<H, T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_get_remove() {
        let table: HandleTable<FileHandle, String> = HandleTable::new();
        let handle = table.insert("first".to_string()).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(handle).unwrap().as_str(), "first");

        let value = table.remove(handle).unwrap();
        assert_eq!(value.as_str(), "first");
        assert!(table.is_empty());
    }

    #[test]
    fn test_stale_handle_is_rejected_after_slot_reuse() {
        let table: HandleTable<FileHandle, u32> = HandleTable::new();
        let stale = table.insert(1).unwrap();
        table.remove(stale).unwrap();

        let fresh = table.insert(2).unwrap();
        assert_ne!(stale, fresh);
        assert_eq!(decode(stale.raw()).0, decode(fresh.raw()).0);

        assert_eq!(table.get(stale).unwrap_err(), RelayError::InvalidHandle(stale.raw()));
        assert_eq!(table.remove(stale).unwrap_err(), RelayError::InvalidHandle(stale.raw()));
        assert_eq!(*table.get(fresh).unwrap(), 2);
    }

    #[test]
    fn test_double_remove_and_unknown_handles() {
        let table: HandleTable<DirHandle, u8> = HandleTable::new();
        let handle = table.insert(9).unwrap();
        table.remove(handle).unwrap();
        assert!(table.remove(handle).is_err());
        assert!(table.get(DirHandle::from_raw(0)).is_err());
        assert!(table.get(DirHandle::from_raw(encode(500, 1))).is_err());
    }

    #[test]
    fn test_handles_are_never_zero() {
        let table: HandleTable<FileHandle, ()> = HandleTable::new();
        let handle = table.insert(()).unwrap();
        assert_ne!(handle.raw(), 0);
    }

    #[test]
    fn test_drain_invalidates_everything() {
        let table: HandleTable<FileHandle, u8> = HandleTable::new();
        let a = table.insert(1).unwrap();
        let b = table.insert(2).unwrap();
        let drained = table.drain();
        assert_eq!(drained.len(), 2);
        assert!(table.get(a).is_err());
        assert!(table.get(b).is_err());
        assert!(table.is_empty());
    }
}
