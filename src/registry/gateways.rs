//! Bounded name table for the gateways heard on the announcement topic.

use std::collections::HashMap;

use log::{debug, warn};

/// Small integer naming a gateway inside this process.
pub type GatewayId = u8;

/// Slot of the local gateway.
pub const SELF_ID: GatewayId = 0;

/// Slot that new names overwrite once the table is full.
pub const OVERFLOW_SLOT: GatewayId = 1;

/// Default capacity, local gateway included.
pub const DEFAULT_MAX_GATEWAYS: usize = 10;

/// Bijective gateway name <-> id mapping with a fixed capacity.
///
/// When full, an unknown name takes over [`OVERFLOW_SLOT`] and the previous
/// occupant is forgotten. Any entry still pointing at that slot is then
/// attributed to the new name. A peer slot vacated by [`GatewayTable::set_self`]
/// is reused before the table grows.
#[derive(Debug, Clone)]
pub struct GatewayTable {
    names: Vec<String>,
    ids: HashMap<String, GatewayId>,
    capacity: usize,
}

impl GatewayTable {
    pub fn new(self_name: &str, capacity: usize) -> Self {
        let capacity = capacity.clamp(2, GatewayId::MAX as usize + 1);
        let mut table = Self {
            names: Vec::with_capacity(capacity),
            ids: HashMap::with_capacity(capacity),
            capacity,
        };
        table.names.push(self_name.to_string());
        table.ids.insert(self_name.to_string(), SELF_ID);
        table
    }

    /// Re-assert the local name in slot 0.
    pub fn set_self(&mut self, self_name: &str) {
        if self.names[SELF_ID as usize] == self_name {
            return;
        }
        let old = std::mem::replace(&mut self.names[SELF_ID as usize], self_name.to_string());
        self.ids.remove(&old);
        // a peer that previously used this name must not alias self
        if let Some(prev) = self.ids.insert(self_name.to_string(), SELF_ID) {
            if prev != SELF_ID {
                self.names[prev as usize].clear();
                warn!("Gateway name {} moved from slot {} to self", self_name, prev);
            }
        }
    }

    pub fn self_name(&self) -> &str {
        &self.names[SELF_ID as usize]
    }

    /// Id for `name`, allocating a slot on first sight.
    pub fn resolve(&mut self, name: &str) -> GatewayId {
        if let Some(&id) = self.ids.get(name) {
            return id;
        }
        let id = if let Some(free) = self.free_slot() {
            self.names[free] = name.to_string();
            free as GatewayId
        } else if self.names.len() < self.capacity {
            self.names.push(name.to_string());
            (self.names.len() - 1) as GatewayId
        } else {
            let slot = OVERFLOW_SLOT as usize;
            let evicted = std::mem::replace(&mut self.names[slot], name.to_string());
            if self.ids.get(&evicted) == Some(&OVERFLOW_SLOT) {
                self.ids.remove(&evicted);
            }
            warn!(
                "Gateway table full ({}), {} replaces {} in slot {}",
                self.capacity, name, evicted, OVERFLOW_SLOT
            );
            OVERFLOW_SLOT
        };
        self.ids.insert(name.to_string(), id);
        debug!("New GW #{}: {}", id, name);
        id
    }

    pub fn name(&self, id: GatewayId) -> Option<&str> {
        self.names
            .get(id as usize)
            .map(String::as_str)
            .filter(|n| !n.is_empty())
    }

    /// Named slots, self included.
    pub fn len(&self) -> usize {
        self.names.iter().filter(|n| !n.is_empty()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Peer slot vacated by `set_self`, if any.
    fn free_slot(&self) -> Option<usize> {
        self.names
            .iter()
            .skip(1)
            .position(String::is_empty)
            .map(|i| i + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_is_slot_zero() {
        let mut t = GatewayTable::new("gw-a", 4);
        assert_eq!(t.resolve("gw-a"), SELF_ID);
        assert_eq!(t.resolve("gw-b"), 1);
        assert_eq!(t.resolve("gw-b"), 1);
        assert_eq!(t.resolve("gw-c"), 2);
        assert_eq!(t.name(2), Some("gw-c"));
    }

    #[test]
    fn overflow_aliases_slot_one() {
        let mut t = GatewayTable::new("self", 3);
        assert_eq!(t.resolve("b"), 1);
        assert_eq!(t.resolve("c"), 2);
        assert_eq!(t.resolve("d"), OVERFLOW_SLOT);
        assert_eq!(t.len(), 3);
        assert_eq!(t.name(OVERFLOW_SLOT), Some("d"));
        // "b" was evicted and gets slot 1 back, displacing "d"
        assert_eq!(t.resolve("b"), OVERFLOW_SLOT);
        assert_eq!(t.resolve("c"), 2);
        assert_eq!(t.resolve("self"), SELF_ID);
    }

    #[test]
    fn set_self_renames_slot_zero() {
        let mut t = GatewayTable::new("old", 4);
        t.set_self("new");
        assert_eq!(t.self_name(), "new");
        assert_eq!(t.resolve("new"), SELF_ID);
        assert_eq!(t.resolve("old"), 1);
    }

    #[test]
    fn set_self_takes_name_away_from_peer() {
        let mut t = GatewayTable::new("gw-a", 4);
        assert_eq!(t.resolve("peer"), 1);
        assert_eq!(t.resolve("gw-c"), 2);
        t.set_self("peer");
        assert_eq!(t.resolve("peer"), SELF_ID);
        assert_eq!(t.name(1), None);
        assert_eq!(t.len(), 2);
        // the vacated slot is handed to the next new name
        assert_eq!(t.resolve("gw-d"), 1);
        assert_eq!(t.name(1), Some("gw-d"));
        assert_eq!(t.resolve("gw-c"), 2);
    }
}
