/// Protocol address to relay index mapping
///
/// Clients address relays through Modbus coil/register addresses; the
/// relay bank addresses them 0..N-1. The mapping between the two is fixed
/// configuration, either a contiguous window (relay `i` at `base + i`) or
/// an explicit enumerated table. There is no implicit arithmetic beyond
/// the single `base` offset of the window form.
///
/// Construction validates the table: relay indices must fall inside the
/// bank and no two protocol addresses may alias the same relay.

use std::collections::HashMap;

use crate::error::{CouplerError, CouplerResult};

/// Fixed, injective map from protocol address to relay index
#[derive(Debug, Clone)]
pub struct AddressMap {
    forward: HashMap<u16, usize>,
    reverse: HashMap<usize, u16>,
}

impl AddressMap {
    /// Contiguous window: relay `i` is addressed at `base + i`
    ///
    /// `base = 0` matches the zero-mode addressing of the observed
    /// deployment; a one-based register layout uses `base = 1`.
    pub fn window(base: u16, relay_count: usize) -> CouplerResult<Self> {
        if base as usize + relay_count > u16::MAX as usize + 1 {
            return Err(CouplerError::configuration(format!(
                "Address window {}+{} overflows the address space",
                base, relay_count
            )));
        }

        let entries: Vec<(u16, usize)> = (0..relay_count)
            .map(|i| (base + i as u16, i))
            .collect();
        Self::from_entries(&entries, relay_count)
    }

    /// Explicit enumerated table of `(protocol_address, relay_index)` pairs
    pub fn from_entries(entries: &[(u16, usize)], relay_count: usize) -> CouplerResult<Self> {
        let mut forward = HashMap::with_capacity(entries.len());
        let mut reverse = HashMap::with_capacity(entries.len());

        for &(address, relay) in entries {
            if relay >= relay_count {
                return Err(CouplerError::configuration(format!(
                    "Address {} maps to relay {} but the bank holds {} relays",
                    address, relay, relay_count
                )));
            }
            if forward.insert(address, relay).is_some() {
                return Err(CouplerError::configuration(format!(
                    "Duplicate mapping for address {}",
                    address
                )));
            }
            if reverse.insert(relay, address).is_some() {
                return Err(CouplerError::configuration(format!(
                    "Relay {} is mapped by more than one address",
                    relay
                )));
            }
        }

        Ok(Self { forward, reverse })
    }

    /// Resolve a protocol address to its relay index
    pub fn resolve(&self, address: u16) -> CouplerResult<usize> {
        self.forward
            .get(&address)
            .copied()
            .ok_or_else(|| CouplerError::address_out_of_range(address))
    }

    /// Protocol address of a relay, for read-back and diagnostics
    pub fn address_of(&self, relay: usize) -> Option<u16> {
        self.reverse.get(&relay).copied()
    }

    /// Check whether an address is mapped at all
    pub fn contains(&self, address: u16) -> bool {
        self.forward.contains_key(&address)
    }

    /// Number of mapped relays
    pub fn len(&self) -> usize {
        self.forward.len()
    }

    /// True when no relay is mapped
    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_zero_based() {
        let map = AddressMap::window(0, 4).unwrap();

        assert_eq!(map.resolve(0).unwrap(), 0);
        assert_eq!(map.resolve(3).unwrap(), 3);
        assert!(map.resolve(4).is_err());
        assert_eq!(map.address_of(2), Some(2));
    }

    #[test]
    fn test_window_with_base() {
        let map = AddressMap::window(100, 4).unwrap();

        assert_eq!(map.resolve(100).unwrap(), 0);
        assert_eq!(map.resolve(103).unwrap(), 3);
        assert!(map.resolve(0).is_err());
        assert!(map.resolve(99).is_err());
        assert_eq!(map.address_of(0), Some(100));
    }

    #[test]
    fn test_explicit_table() {
        let map = AddressMap::from_entries(&[(10, 2), (20, 0), (30, 1)], 4).unwrap();

        assert_eq!(map.resolve(10).unwrap(), 2);
        assert_eq!(map.resolve(20).unwrap(), 0);
        assert!(map.resolve(11).is_err());
        assert_eq!(map.len(), 3);
        assert_eq!(map.address_of(1), Some(30));
    }

    #[test]
    fn test_unmapped_address_error() {
        let map = AddressMap::window(0, 4).unwrap();
        let err = map.resolve(99).unwrap_err();
        assert!(matches!(err, CouplerError::AddressOutOfRange { address: 99 }));
    }

    #[test]
    fn test_rejects_aliasing_and_out_of_bank() {
        // two addresses driving one relay
        assert!(AddressMap::from_entries(&[(0, 1), (1, 1)], 4).is_err());
        // one address mapped twice
        assert!(AddressMap::from_entries(&[(0, 0), (0, 1)], 4).is_err());
        // relay index outside the bank
        assert!(AddressMap::from_entries(&[(0, 4)], 4).is_err());
    }

    #[test]
    fn test_window_overflow() {
        assert!(AddressMap::window(u16::MAX, 2).is_err());
        assert!(AddressMap::window(u16::MAX, 1).is_ok());
    }
}
