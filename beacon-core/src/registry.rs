//! Address registry: dense integer IDs for opaque device addresses.
//!
//! IDs are assigned in first-seen order starting at 0 and are never
//! reused or removed. Both directions are updated together so
//! `resolve(intern(a)) == a` always holds.

use std::collections::HashMap;

/// Bidirectional `address <-> id` map.
#[derive(Debug, Default, Clone)]
pub struct AddressRegistry {
    ids: HashMap<String, u32>,
    addresses: Vec<String>, // index == id
}

impl AddressRegistry {
    pub fn new() -> Self {
        AddressRegistry::default()
    }

    /// Return the ID for `address`, assigning the next one if unseen.
    pub fn intern(&mut self, address: &str) -> u32 {
        if let Some(&id) = self.ids.get(address) {
            return id;
        }
        let id = self.addresses.len() as u32;
        self.addresses.push(address.to_string());
        self.ids.insert(address.to_string(), id);
        id
    }

    /// Address for an ID, or `None` if the ID was never assigned.
    pub fn resolve(&self, id: u32) -> Option<&str> {
        self.addresses.get(id as usize).map(String::as_str)
    }

    /// ID for an address without interning it.
    pub fn lookup(&self, address: &str) -> Option<u32> {
        self.ids.get(address).copied()
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    /// All `(id, address)` pairs in ID order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &str)> {
        self.addresses
            .iter()
            .enumerate()
            .map(|(i, a)| (i as u32, a.as_str()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
