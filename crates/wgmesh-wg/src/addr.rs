//! Deterministic overlay address assignment
//!
//! Every node derives its overlay address from its name: the shared
//! prefix keeps its network bytes and the trailing host bytes come from
//! the FNV-1a 128 hash of the name. The address is stable across
//! restarts as long as the name is stable; name collisions are an
//! operator error and are not detected here.

use std::net::Ipv6Addr;

use ipnet::Ipv6Net;

use crate::error::WgError;

const FNV128_OFFSET_BASIS: u128 = 0x6c62272e07bb014262b821756295c58d;
const FNV128_PRIME: u128 = 0x0000000001000000000000000000013b;

/// FNV-1a over the full 128-bit state.
fn fnv1a_128(data: &[u8]) -> u128 {
    data.iter().fold(FNV128_OFFSET_BASIS, |hash, byte| {
        (hash ^ u128::from(*byte)).wrapping_mul(FNV128_PRIME)
    })
}

/// Map `node_name` into the host bits of `prefix`: the last
/// `(128 - prefix_len) / 8` bytes of the network address are overwritten
/// with the last bytes of the name hash. An empty name falls back to the
/// operating-system hostname.
pub fn overlay_address(prefix: &Ipv6Net, node_name: &str) -> Result<Ipv6Addr, WgError> {
    let name = if node_name.is_empty() {
        hostname::get()?.to_string_lossy().into_owned()
    } else {
        node_name.to_string()
    };

    let mut octets = prefix.network().octets();
    let hash = fnv1a_128(name.as_bytes()).to_be_bytes();

    let host_bytes = (128 - usize::from(prefix.prefix_len())) / 8;
    for i in 1..=host_bytes {
        octets[16 - i] = hash[16 - i];
    }

    Ok(Ipv6Addr::from(octets))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prefix() -> Ipv6Net {
        "fd6d:142e:65e7:4cc1::/64".parse().unwrap()
    }

    #[test]
    fn test_fnv1a_128_empty_input_is_offset_basis() {
        assert_eq!(fnv1a_128(b""), FNV128_OFFSET_BASIS);
    }

    #[test]
    fn test_address_is_deterministic() {
        let a = overlay_address(&prefix(), "alpha").unwrap();
        let b = overlay_address(&prefix(), "alpha").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_address_preserves_network_bytes() {
        let addr = overlay_address(&prefix(), "alpha").unwrap();
        assert_eq!(addr.octets()[..8], prefix().network().octets()[..8]);
    }

    #[test]
    fn test_address_host_bytes_are_hash_tail() {
        let addr = overlay_address(&prefix(), "beta").unwrap();
        let hash = fnv1a_128(b"beta").to_be_bytes();
        assert_eq!(addr.octets()[8..], hash[8..]);
    }

    #[test]
    fn test_different_names_get_different_addresses() {
        let a = overlay_address(&prefix(), "alpha").unwrap();
        let b = overlay_address(&prefix(), "beta").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_narrow_prefix_replaces_fewer_bytes() {
        let narrow: Ipv6Net = "fd6d:142e:65e7:4cc1:aaaa:bbbb::/112".parse().unwrap();
        let addr = overlay_address(&narrow, "alpha").unwrap();
        assert_eq!(addr.octets()[..14], narrow.network().octets()[..14]);
        let hash = fnv1a_128(b"alpha").to_be_bytes();
        assert_eq!(addr.octets()[14..], hash[14..]);
    }

    #[test]
    fn test_empty_name_uses_hostname_consistently() {
        let a = overlay_address(&prefix(), "").unwrap();
        let b = overlay_address(&prefix(), "").unwrap();
        assert_eq!(a, b);
    }
}
