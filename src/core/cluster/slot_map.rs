// src/core/cluster/slot_map.rs

//! The in-memory slot-to-node mapping.

use crate::core::slot::NUM_SLOTS;

/// Maps each of the 16384 hash slots to an ordered list of node keys.
/// The first key of a non-empty list is the slot's primary; the rest are
/// replicas.
#[derive(Debug)]
pub struct SlotMap {
    slots: Vec<Vec<String>>,
}

impl SlotMap {
    pub fn new() -> Self {
        Self {
            slots: vec![Vec::new(); NUM_SLOTS],
        }
    }

    /// The ordered node-key list serving a slot; empty when unassigned.
    pub fn lookup(&self, slot: u16) -> &[String] {
        &self.slots[slot as usize]
    }

    /// Overwrites the inclusive range `[start..=end]` with the given list.
    pub fn assign_range(&mut self, start: u16, end: u16, keys: &[String]) {
        for slot in start..=end {
            self.slots[slot as usize] = keys.to_vec();
        }
    }

    /// Points a slot's primary at a new node key, as a MOVED redirection
    /// demands. Inserts a fresh single-entry list when the slot was empty,
    /// otherwise replaces the head and keeps the replica tail.
    pub fn set_primary(&mut self, slot: u16, key: String) {
        let entry = &mut self.slots[slot as usize];
        if entry.is_empty() {
            entry.push(key);
        } else {
            entry[0] = key;
        }
    }

    /// Drops every assignment.
    pub fn clear(&mut self) {
        for entry in &mut self.slots {
            entry.clear();
        }
    }

    /// Number of slots currently assigned to at least one node.
    pub fn assigned(&self) -> usize {
        self.slots.iter().filter(|keys| !keys.is_empty()).count()
    }
}

impl Default for SlotMap {
    fn default() -> Self {
        Self::new()
    }
}
