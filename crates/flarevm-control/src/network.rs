//! Network identity derivation.
//!
//! The registry leases slot numbers; everything else about a VM's network
//! identity is a pure function of the slot, so two VMs can only collide if
//! they hold the same lease.

use std::net::Ipv4Addr;

use flarevm_store::NetworkIdentity;

use crate::error::{ControlError, Result};
use crate::types::NetworkConfig;

/// Addresses per slot: network, tap, guest, broadcast.
const BLOCK_SIZE: u32 = 4;

/// Derive the network identity for `slot`.
///
/// # Errors
///
/// Returns `ControlError::ResourceExhausted` if the slot lies outside the
/// pool or its block would overflow the IPv4 address space.
pub fn identity_for_slot(config: &NetworkConfig, slot: u32) -> Result<NetworkIdentity> {
    if slot >= config.capacity {
        return Err(ControlError::ResourceExhausted(format!(
            "network slot {slot} is outside the pool of {}",
            config.capacity
        )));
    }

    let block = slot
        .checked_mul(BLOCK_SIZE)
        .and_then(|offset| u32::from(config.subnet).checked_add(offset))
        .filter(|base| base.checked_add(BLOCK_SIZE - 1).is_some())
        .ok_or_else(|| {
            ControlError::ResourceExhausted(format!(
                "network slot {slot} overflows subnet {}",
                config.subnet
            ))
        })?;

    let tap_ip = Ipv4Addr::from(block + 1);
    let ip_address = Ipv4Addr::from(block + 2);

    Ok(NetworkIdentity {
        slot,
        ip_address,
        mac_address: mac_for(ip_address),
        tap_device_name: format!("{}{slot}", config.tap_prefix),
        tap_ip,
        network_namespace: config.namespace.clone(),
    })
}

/// Locally administered MAC address embedding the guest IP.
#[must_use]
pub fn mac_for(ip: Ipv4Addr) -> String {
    let [a, b, c, d] = ip.octets();
    format!("06:00:{a:02x}:{b:02x}:{c:02x}:{d:02x}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn first_slot_identity() {
        let config = NetworkConfig::default();
        let id = identity_for_slot(&config, 0).unwrap();

        assert_eq!(id.tap_ip, Ipv4Addr::new(172, 16, 0, 1));
        assert_eq!(id.ip_address, Ipv4Addr::new(172, 16, 0, 2));
        assert_eq!(id.mac_address, "06:00:ac:10:00:02");
        assert_eq!(id.tap_device_name, "fctap0");
        assert_eq!(id.network_namespace, "flarevm");
    }

    #[test]
    fn slots_do_not_overlap() {
        let config = NetworkConfig {
            capacity: 300,
            ..NetworkConfig::default()
        };

        let mut ips = HashSet::new();
        let mut macs = HashSet::new();
        let mut taps = HashSet::new();
        for slot in 0..config.capacity {
            let id = identity_for_slot(&config, slot).unwrap();
            assert!(ips.insert(id.ip_address));
            assert!(ips.insert(id.tap_ip));
            assert!(macs.insert(id.mac_address));
            assert!(taps.insert(id.tap_device_name));
        }

        let last = identity_for_slot(&config, 299).unwrap();
        assert_eq!(last.ip_address, Ipv4Addr::new(172, 16, 4, 174));
    }

    #[test]
    fn slot_outside_pool_is_rejected() {
        let config = NetworkConfig {
            capacity: 2,
            ..NetworkConfig::default()
        };
        assert!(matches!(
            identity_for_slot(&config, 2),
            Err(ControlError::ResourceExhausted(_))
        ));
    }

    #[test]
    fn overflowing_subnet_is_rejected() {
        let config = NetworkConfig {
            subnet: Ipv4Addr::new(255, 255, 255, 252),
            capacity: 4,
            ..NetworkConfig::default()
        };
        assert!(identity_for_slot(&config, 0).is_ok());
        assert!(identity_for_slot(&config, 1).is_err());
    }
}
