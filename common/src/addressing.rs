use std::net::Ipv4Addr;

use serde::Serialize;

use crate::{
    config::NetworkConfig,
    error::{NodeError, NodeResult},
};

/// Longest hostname handed to DHCP and mDNS.
pub const MAX_HOSTNAME_LEN: usize = 24;
pub const FALLBACK_HOSTNAME: &str = "esp-sensor";

/// Lower-cases `raw`, collapses every run of non-alphanumerics into one `-`, strips
/// leading and trailing hyphens and caps the length. An empty result falls back to the
/// sanitized `fallback`, then to [`FALLBACK_HOSTNAME`].
pub fn sanitize_hostname(raw: &str, fallback: &str) -> String {
    let sanitized = sanitize_label(raw);
    if !sanitized.is_empty() {
        return sanitized;
    }
    let fallback = sanitize_label(fallback);
    if !fallback.is_empty() {
        return fallback;
    }
    FALLBACK_HOSTNAME.to_string()
}

fn sanitize_label(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len().min(MAX_HOSTNAME_LEN));
    let mut pending_hyphen = false;

    for c in raw.trim().chars() {
        if c.is_ascii_alphanumeric() {
            if pending_hyphen && !out.is_empty() {
                out.push('-');
            }
            pending_hyphen = false;
            out.push(c.to_ascii_lowercase());
        } else {
            pending_hyphen = true;
        }
        if out.len() >= MAX_HOSTNAME_LEN {
            break;
        }
    }

    out.truncate(MAX_HOSTNAME_LEN);
    while out.ends_with('-') {
        out.pop();
    }
    out
}

/// Station hostname: the configured name, else the device location.
pub fn station_hostname(network: &NetworkConfig, device_location: &str) -> String {
    sanitize_hostname(&network.hostname, device_location)
}

/// Advertised mDNS name: the configured name, else the applied station hostname.
pub fn advertised_name(network: &NetworkConfig, station_hostname: &str) -> String {
    sanitize_hostname(&network.mdns_hostname, station_hostname)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StaticAddress {
    pub ip: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub subnet: Ipv4Addr,
    pub dns1: Ipv4Addr,
    pub dns2: Ipv4Addr,
}

impl StaticAddress {
    pub fn prefix_len(&self) -> u8 {
        // Contiguity is checked at parse time.
        u32::from(self.subnet).leading_ones() as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum AddressConfig {
    #[default]
    Dhcp,
    Static(StaticAddress),
}

impl AddressConfig {
    /// Builds the desired station addressing. A static request whose ip, gateway or
    /// subnet does not parse is an error; the caller decides the fallback.
    pub fn from_network(network: &NetworkConfig) -> NodeResult<Self> {
        if !network.use_static_ip {
            return Ok(Self::Dhcp);
        }

        let ip = parse_required("static_ip", &network.static_ip)?;
        let gateway = parse_required("gateway", &network.gateway)?;
        let subnet = parse_required("subnet", &network.subnet)?;
        if !is_contiguous_mask(subnet) {
            return Err(NodeError::InvalidAddress {
                field: "subnet",
                value: network.subnet.clone(),
            });
        }

        let dns1 = parse_optional(&network.dns1).unwrap_or(gateway);
        let dns2 = parse_optional(&network.dns2).unwrap_or(dns1);

        Ok(Self::Static(StaticAddress {
            ip,
            gateway,
            subnet,
            dns1,
            dns2,
        }))
    }

    pub fn is_static(&self) -> bool {
        matches!(self, Self::Static(_))
    }
}

fn parse_required(field: &'static str, text: &str) -> NodeResult<Ipv4Addr> {
    text.trim()
        .parse::<Ipv4Addr>()
        .map_err(|_| NodeError::InvalidAddress {
            field,
            value: text.to_string(),
        })
}

fn parse_optional(text: &str) -> Option<Ipv4Addr> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    text.parse().ok()
}

fn is_contiguous_mask(mask: Ipv4Addr) -> bool {
    let bits = u32::from(mask);
    bits.leading_ones() + bits.trailing_zeros() == 32
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn static_network(ip: &str, gateway: &str, subnet: &str) -> NetworkConfig {
        NetworkConfig {
            use_static_ip: true,
            static_ip: ip.into(),
            gateway: gateway.into(),
            subnet: subnet.into(),
            ..Default::default()
        }
    }

    #[test]
    fn hostnames_are_lowercased_and_collapsed() {
        assert_eq!(sanitize_hostname("  Living Room__Sensor ", ""), "living-room-sensor");
        assert_eq!(sanitize_hostname("--Attic!!#2--", ""), "attic-2");
        assert_eq!(sanitize_hostname("a . b", ""), "a-b");
    }

    #[test]
    fn hostnames_are_length_capped_without_trailing_hyphen() {
        let name = sanitize_hostname("abcdefghijklmnopqrstuvw-xyz", "");
        assert_eq!(name, "abcdefghijklmnopqrstuvw");
        assert!(name.len() <= MAX_HOSTNAME_LEN);
        assert_eq!(sanitize_hostname(&"x".repeat(40), "").len(), MAX_HOSTNAME_LEN);
    }

    #[test]
    fn empty_hostname_uses_fallback_chain() {
        assert_eq!(sanitize_hostname("***", "Garage Node"), "garage-node");
        assert_eq!(sanitize_hostname("", "!!"), FALLBACK_HOSTNAME);
    }

    #[test]
    fn advertised_name_falls_back_to_station_hostname() {
        let network = NetworkConfig {
            hostname: String::new(),
            mdns_hostname: String::new(),
            ..Default::default()
        };
        let station = station_hostname(&network, "Back Porch");
        assert_eq!(station, "back-porch");
        assert_eq!(advertised_name(&network, &station), "back-porch");
    }

    #[test]
    fn dhcp_when_static_disabled() {
        let mut network = static_network("10.0.0.5", "10.0.0.1", "255.255.255.0");
        network.use_static_ip = false;
        assert_eq!(AddressConfig::from_network(&network), Ok(AddressConfig::Dhcp));
    }

    #[test]
    fn dns_defaults_follow_gateway() {
        let network = static_network("10.0.0.5", "10.0.0.1", "255.255.255.0");
        let AddressConfig::Static(address) = AddressConfig::from_network(&network).unwrap() else {
            panic!("expected static addressing");
        };
        assert_eq!(address.dns1, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(address.dns2, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(address.prefix_len(), 24);

        let mut network = network;
        network.dns1 = "1.1.1.1".into();
        network.dns2 = "bogus".into();
        let AddressConfig::Static(address) = AddressConfig::from_network(&network).unwrap() else {
            panic!("expected static addressing");
        };
        assert_eq!(address.dns1, Ipv4Addr::new(1, 1, 1, 1));
        assert_eq!(address.dns2, Ipv4Addr::new(1, 1, 1, 1));
    }

    #[test]
    fn invalid_static_fields_are_rejected() {
        let network = static_network("10.0.0.300", "10.0.0.1", "255.255.255.0");
        assert_eq!(
            AddressConfig::from_network(&network),
            Err(NodeError::InvalidAddress {
                field: "static_ip",
                value: "10.0.0.300".into(),
            })
        );

        let network = static_network("10.0.0.5", "10.0.0.1", "255.0.255.0");
        assert!(AddressConfig::from_network(&network).is_err());

        let network = static_network("10.0.0.5", "", "255.255.255.0");
        assert!(AddressConfig::from_network(&network).is_err());
    }
}
