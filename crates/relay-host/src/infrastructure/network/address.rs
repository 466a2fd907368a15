//! Address resolution: picks the IPv4 address a phone on the same LAN should
//! dial to reach this host.
//!
//! # Why is this not just "the local IP"? (for beginners)
//!
//! A typical laptop has several network interfaces at once: the loopback
//! interface (`lo`, always `127.0.0.1`), Wi-Fi, maybe Ethernet, and often a
//! handful of virtual bridges created by Docker or a VM manager.  Only some of
//! those addresses are reachable from a phone on the same Wi-Fi network, and
//! the operating system offers no single call that answers "which one?".
//!
//! The resolver therefore enumerates every interface and applies explicit,
//! deterministic rules:
//!
//! 1. Drop loopback and unspecified addresses (never reachable from outside).
//! 2. Drop IPv6 addresses (the pairing payload carries an IPv4 address).
//! 3. Rank the rest: physical interfaces before virtual ones (`docker*`,
//!    `br-*`, `veth*`, `virbr*`) and link-local `169.254.x.x` addresses.
//! 4. Break ties by interface name, then by address, so the same machine
//!    always produces the same answer.
//!
//! When nothing survives step 2 the resolver returns
//! [`AddressResolutionError::NotFound`]; the caller decides how to degrade
//! (the host falls back to loopback and tells the user remote pairing is
//! disabled).
//!
//! The result is computed fresh on every call.  Interfaces come and go
//! (laptop joins a different Wi-Fi), so caching would hand out stale
//! addresses.

use std::cmp::Ordering;
use std::net::{IpAddr, Ipv4Addr};

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

/// Errors produced while resolving the host's LAN address.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressResolutionError {
    /// No external IPv4 address exists on any interface.
    #[error("no external IPv4 address found on any network interface")]
    NotFound,

    /// The operating system refused to enumerate interfaces.
    #[error("failed to enumerate network interfaces: {0}")]
    Enumeration(String),
}

/// One address bound to one interface, as reported by the OS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InterfaceAddress {
    /// Interface name, e.g. `en0`, `wlan0`, `Wi-Fi`.
    pub name: String,
    pub address: IpAddr,
    /// `true` for loopback addresses.
    pub internal: bool,
}

impl InterfaceAddress {
    pub fn new(name: impl Into<String>, address: IpAddr) -> Self {
        Self {
            name: name.into(),
            address,
            internal: address.is_loopback(),
        }
    }
}

/// The address selected for the pairing payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkAddress {
    pub address: Ipv4Addr,
    pub interface: String,
    /// `true` only for the loopback fallback.
    pub internal: bool,
}

impl NetworkAddress {
    /// The fallback used when no external address exists.
    pub fn loopback() -> Self {
        Self {
            address: Ipv4Addr::LOCALHOST,
            interface: "lo".to_string(),
            internal: true,
        }
    }
}

/// Source of interface addresses.
///
/// Production code uses [`SystemInterfaces`]; tests substitute a mock so the
/// selection rules can be exercised without touching the real network stack.
#[cfg_attr(test, mockall::automock)]
pub trait InterfaceSource: Send + Sync {
    /// Returns every (interface, address) pair known to the OS.
    ///
    /// # Errors
    ///
    /// Returns [`AddressResolutionError::Enumeration`] if the OS call fails.
    fn interfaces(&self) -> Result<Vec<InterfaceAddress>, AddressResolutionError>;
}

/// Reads interfaces from the operating system via `local-ip-address`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemInterfaces;

impl InterfaceSource for SystemInterfaces {
    fn interfaces(&self) -> Result<Vec<InterfaceAddress>, AddressResolutionError> {
        let list = local_ip_address::list_afinet_netifas()
            .map_err(|e| AddressResolutionError::Enumeration(e.to_string()))?;
        Ok(list
            .into_iter()
            .map(|(name, address)| InterfaceAddress::new(name, address))
            .collect())
    }
}

/// Interface name prefixes of virtual bridges that a phone usually cannot
/// reach.  They are ranked last rather than removed.
const VIRTUAL_PREFIXES: &[&str] = &["docker", "br-", "veth", "virbr", "vmnet", "vboxnet"];

fn is_virtual(name: &str) -> bool {
    VIRTUAL_PREFIXES.iter().any(|prefix| name.starts_with(prefix))
}

/// Lower rank = better candidate.
fn rank(candidate: &NetworkAddress) -> u8 {
    match (is_virtual(&candidate.interface), candidate.address.is_link_local()) {
        (false, false) => 0,
        (false, true) => 1,
        (true, false) => 2,
        (true, true) => 3,
    }
}

fn compare(a: &NetworkAddress, b: &NetworkAddress) -> Ordering {
    rank(a)
        .cmp(&rank(b))
        .then_with(|| a.interface.cmp(&b.interface))
        .then_with(|| a.address.cmp(&b.address))
}

/// Returns every external IPv4 address, best candidate first.
///
/// # Errors
///
/// Propagates [`AddressResolutionError::Enumeration`] from the source.  An
/// empty list is not an error here.
pub fn resolve_candidates(
    source: &dyn InterfaceSource,
) -> Result<Vec<NetworkAddress>, AddressResolutionError> {
    let mut candidates: Vec<NetworkAddress> = source
        .interfaces()?
        .into_iter()
        .filter(|iface| !iface.internal)
        .filter_map(|iface| match iface.address {
            IpAddr::V4(v4) if !v4.is_loopback() && !v4.is_unspecified() => Some(NetworkAddress {
                address: v4,
                interface: iface.name,
                internal: false,
            }),
            _ => None,
        })
        .collect();

    candidates.sort_by(compare);
    candidates.dedup();
    Ok(candidates)
}

/// Selects the single address to embed in the pairing payload.
///
/// # Errors
///
/// Returns [`AddressResolutionError::NotFound`] when no external IPv4
/// address exists, or [`AddressResolutionError::Enumeration`] if the source
/// fails.
///
/// # Examples
///
/// ```rust,ignore
/// let addr = resolve_primary_address(&SystemInterfaces)?;
/// println!("phones should dial {}", addr.address);
/// ```
pub fn resolve_primary_address(
    source: &dyn InterfaceSource,
) -> Result<NetworkAddress, AddressResolutionError> {
    let candidates = resolve_candidates(source)?;
    debug!("address candidates: {candidates:?}");
    candidates
        .into_iter()
        .next()
        .ok_or(AddressResolutionError::NotFound)
}

/// Full enumeration plus the selection, for the `interfaces` subcommand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostics {
    pub interfaces: Vec<InterfaceAddress>,
    pub candidates: Vec<NetworkAddress>,
    pub selected: Option<NetworkAddress>,
}

/// Enumerates interfaces and reports which address would be selected.
///
/// # Errors
///
/// Returns [`AddressResolutionError::Enumeration`] if the source fails.
pub fn diagnose(source: &dyn InterfaceSource) -> Result<Diagnostics, AddressResolutionError> {
    let mut interfaces = source.interfaces()?;
    interfaces.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.address.cmp(&b.address)));
    let candidates = resolve_candidates(source)?;
    let selected = candidates.first().cloned();
    Ok(Diagnostics {
        interfaces,
        candidates,
        selected,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn iface(name: &str, addr: &str) -> InterfaceAddress {
        InterfaceAddress::new(name, addr.parse().unwrap())
    }

    fn source_with(list: Vec<InterfaceAddress>) -> MockInterfaceSource {
        let mut source = MockInterfaceSource::new();
        source.expect_interfaces().returning(move || Ok(list.clone()));
        source
    }

    #[test]
    fn test_selects_external_address_over_loopback() {
        // Arrange
        let source = source_with(vec![iface("lo", "127.0.0.1"), iface("en0", "192.168.1.42")]);

        // Act
        let selected = resolve_primary_address(&source).unwrap();

        // Assert
        assert_eq!(selected.address, Ipv4Addr::new(192, 168, 1, 42));
        assert_eq!(selected.interface, "en0");
        assert!(!selected.internal);
    }

    #[test]
    fn test_only_loopback_is_not_found() {
        let source = source_with(vec![iface("lo", "127.0.0.1")]);
        assert_eq!(
            resolve_primary_address(&source),
            Err(AddressResolutionError::NotFound)
        );
    }

    #[test]
    fn test_ipv6_addresses_are_ignored() {
        let source = source_with(vec![iface("lo", "::1"), iface("en0", "fe80::1")]);
        assert_eq!(
            resolve_primary_address(&source),
            Err(AddressResolutionError::NotFound)
        );
    }

    #[test]
    fn test_tie_break_is_by_interface_name_then_address() {
        // Arrange – deliberately unsorted input
        let source = source_with(vec![
            iface("wlan0", "10.0.0.7"),
            iface("en1", "192.168.1.9"),
            iface("en1", "192.168.1.3"),
        ]);

        // Act
        let candidates = resolve_candidates(&source).unwrap();

        // Assert
        let order: Vec<(String, Ipv4Addr)> = candidates
            .into_iter()
            .map(|c| (c.interface, c.address))
            .collect();
        assert_eq!(
            order,
            vec![
                ("en1".to_string(), Ipv4Addr::new(192, 168, 1, 3)),
                ("en1".to_string(), Ipv4Addr::new(192, 168, 1, 9)),
                ("wlan0".to_string(), Ipv4Addr::new(10, 0, 0, 7)),
            ]
        );
    }

    #[test]
    fn test_virtual_bridges_rank_after_physical_interfaces() {
        let source = source_with(vec![
            iface("br-1a2b", "172.18.0.1"),
            iface("docker0", "172.17.0.1"),
            iface("wlp2s0", "192.168.0.23"),
        ]);

        let selected = resolve_primary_address(&source).unwrap();

        assert_eq!(selected.interface, "wlp2s0");
    }

    #[test]
    fn test_virtual_bridge_is_used_when_nothing_else_exists() {
        let source = source_with(vec![iface("lo", "127.0.0.1"), iface("docker0", "172.17.0.1")]);
        let selected = resolve_primary_address(&source).unwrap();
        assert_eq!(selected.address, Ipv4Addr::new(172, 17, 0, 1));
    }

    #[test]
    fn test_link_local_ranks_after_routable_address() {
        let source = source_with(vec![iface("en0", "169.254.10.2"), iface("en5", "10.1.2.3")]);
        let selected = resolve_primary_address(&source).unwrap();
        assert_eq!(selected.interface, "en5");
    }

    #[test]
    fn test_enumeration_failure_is_propagated() {
        let mut source = MockInterfaceSource::new();
        source
            .expect_interfaces()
            .returning(|| Err(AddressResolutionError::Enumeration("EPERM".to_string())));

        assert_eq!(
            resolve_primary_address(&source),
            Err(AddressResolutionError::Enumeration("EPERM".to_string()))
        );
    }

    #[test]
    fn test_each_resolution_queries_the_source_again() {
        // No caching: two resolutions mean two enumerations.
        let mut source = MockInterfaceSource::new();
        source
            .expect_interfaces()
            .times(2)
            .returning(|| Ok(vec![InterfaceAddress::new("en0", "192.168.1.42".parse().unwrap())]));

        resolve_primary_address(&source).unwrap();
        resolve_primary_address(&source).unwrap();
    }

    #[test]
    fn test_diagnose_reports_all_interfaces_and_selection() {
        let source = source_with(vec![iface("en0", "192.168.1.42"), iface("lo", "127.0.0.1")]);

        let report = diagnose(&source).unwrap();

        assert_eq!(report.interfaces.len(), 2);
        assert_eq!(report.interfaces[0].name, "en0");
        assert!(report.interfaces[1].internal);
        assert_eq!(report.candidates.len(), 1);
        assert_eq!(
            report.selected.map(|s| s.address),
            Some(Ipv4Addr::new(192, 168, 1, 42))
        );
    }

    #[test]
    fn test_loopback_fallback_is_marked_internal() {
        let fallback = NetworkAddress::loopback();
        assert_eq!(fallback.address, Ipv4Addr::LOCALHOST);
        assert!(fallback.internal);
    }
}
