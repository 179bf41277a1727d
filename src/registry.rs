//! Adapter-wide device registry: three indexes that must always agree,
//! plus bitmap address assignment.

use crate::error::{AdapterError, AdapterResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A SCSI adapter can only field so many buses and targets before it runs
/// out of bitmap to assign addresses from.
pub const MAX_BUSES: u16 = 64;
pub const MAX_TARGETS: u16 = 255;

/// Bus/target address a device occupies. Lun is always 0: this adapter
/// gives every device its own target rather than multiplexing luns under
/// a shared target, matching how the bitmap allocator only ever walks
/// (bus, target) pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address {
    pub bus: u16,
    pub target: u16,
    pub lun: u16,
}

/// Anything the registry can index must expose a stable connection id,
/// address and instance name. Implemented by `engine::DeviceEngine`; kept
/// as a trait here so the registry never needs to know about request
/// queues, backends, or anything else an engine carries.
pub trait RegisteredDevice: Send + Sync {
    fn connection_id(&self) -> u64;
    fn address(&self) -> Address;
    fn instance_name(&self) -> &str;
}

/// First-fit bitmap allocator over the (bus, target) address space.
#[derive(Debug)]
struct AddressAllocator {
    in_use: Vec<bool>,
}

impl AddressAllocator {
    fn new() -> Self {
        AddressAllocator {
            in_use: vec![false; MAX_BUSES as usize * MAX_TARGETS as usize],
        }
    }

    fn index(bus: u16, target: u16) -> usize {
        bus as usize * MAX_TARGETS as usize + target as usize
    }

    fn allocate(&mut self) -> AdapterResult<Address> {
        for bus in 0..MAX_BUSES {
            for target in 0..MAX_TARGETS {
                let idx = Self::index(bus, target);
                if !self.in_use[idx] {
                    self.in_use[idx] = true;
                    return Ok(Address {
                        bus,
                        target,
                        lun: 0,
                    });
                }
            }
        }
        Err(AdapterError::OutOfResources(
            "no free bus/target address".into(),
        ))
    }

    fn free(&mut self, address: Address) {
        let idx = Self::index(address.bus, address.target);
        self.in_use[idx] = false;
    }
}

/// The adapter-wide registry. Every insert/remove touches all three
/// indexes and, for insert, the address bitmap, under one lock held by
/// the caller (the registry itself holds no lock: callers wrap it in
/// `Mutex`/`RwLock` to compose with the rundown-acquire-under-lock
/// contract described in `rundown`).
#[derive(Debug)]
pub struct DeviceRegistry<T: RegisteredDevice + ?Sized> {
    by_connection_id: HashMap<u64, Arc<T>>,
    by_address: HashMap<Address, Arc<T>>,
    by_name: HashMap<String, Arc<T>>,
    addresses: AddressAllocator,
    next_connection_id: AtomicU64,
}

impl<T: RegisteredDevice + ?Sized> Default for DeviceRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: RegisteredDevice + ?Sized> DeviceRegistry<T> {
    pub fn new() -> Self {
        DeviceRegistry {
            by_connection_id: HashMap::new(),
            by_address: HashMap::new(),
            by_name: HashMap::new(),
            addresses: AddressAllocator::new(),
            next_connection_id: AtomicU64::new(1),
        }
    }

    /// Allocates a fresh connection id. Does not touch the indexes.
    pub fn allocate_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Allocates a bus/target address for a new device.
    pub fn allocate_address(&mut self) -> AdapterResult<Address> {
        self.addresses.allocate()
    }

    /// Inserts a newly-created device into all three indexes. Rejects a
    /// duplicate instance name before anything is mutated.
    pub fn insert(&mut self, device: Arc<T>) -> AdapterResult<()> {
        if self.by_name.contains_key(device.instance_name()) {
            return Err(AdapterError::NameCollision(
                device.instance_name().to_string(),
            ));
        }
        self.by_connection_id
            .insert(device.connection_id(), Arc::clone(&device));
        self.by_address
            .insert(device.address(), Arc::clone(&device));
        self.by_name
            .insert(device.instance_name().to_string(), device);
        Ok(())
    }

    /// Removes a device from all three indexes and frees its address.
    pub fn remove_by_connection_id(&mut self, connection_id: u64) -> Option<Arc<T>> {
        let device = self.by_connection_id.remove(&connection_id)?;
        self.by_address.remove(&device.address());
        self.by_name.remove(device.instance_name());
        self.addresses.free(device.address());
        Some(device)
    }

    pub fn get_by_connection_id(&self, connection_id: u64) -> Option<Arc<T>> {
        self.by_connection_id.get(&connection_id).cloned()
    }

    pub fn get_by_address(&self, address: Address) -> Option<Arc<T>> {
        self.by_address.get(&address).cloned()
    }

    pub fn get_by_name(&self, name: &str) -> Option<Arc<T>> {
        self.by_name.get(name).cloned()
    }

    pub fn list(&self) -> Vec<Arc<T>> {
        self.by_connection_id.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.by_connection_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_connection_id.is_empty()
    }
}
