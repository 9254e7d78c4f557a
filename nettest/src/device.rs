//! Device emulation collaborator
//!
//! Streams may be sent on behalf of emulated hosts. Before transmit, the
//! port asks the device manager to resolve the next-hop neighbor of every
//! frame, and later asks which MAC addresses a given frame should carry.
//! Lookups only see the leading [`MAX_L3_INSPECT`] bytes of a frame.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Longest frame prefix a device lookup inspects
pub const MAX_L3_INSPECT: usize = 80;

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86DD;
const ETHERTYPE_VLAN: u16 = 0x8100;
const ETHERTYPE_QINQ: u16 = 0x88A8;

/// Stacked 802.1Q / 802.1ad tags skipped before giving up
const MAX_VLAN_TAGS: usize = 4;

/// 48-bit Ethernet address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MacAddr(pub [u8; 6]);

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

/// Neighbor resolution and MAC lookup for emulated devices
pub trait DeviceManager: Send {
    /// Trigger resolution of the neighbor `frame` is addressed to
    fn resolve_neighbors(&mut self, frame: &[u8]);

    /// Forget every resolved neighbor
    fn clear_neighbors(&mut self);

    /// MAC of the emulated device sending `frame`
    fn device_mac(&self, frame: &[u8]) -> Option<MacAddr>;

    /// Resolved MAC of the neighbor `frame` is addressed to
    fn neighbor_mac(&self, frame: &[u8]) -> Option<MacAddr>;
}

/// Source and destination addresses of an IP frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct L3Endpoints {
    pub src: IpAddr,
    pub dst: IpAddr,
}

/// Locate the IP addresses inside an Ethernet frame
///
/// Skips up to four stacked VLAN tags. Looks no further than [`MAX_L3_INSPECT`]
/// bytes.
pub fn l3_endpoints(frame: &[u8]) -> Option<L3Endpoints> {
    let frame = &frame[..frame.len().min(MAX_L3_INSPECT)];

    let mut offset = 12;
    let mut ethertype = read_u16(frame, offset)?;
    for _ in 0..MAX_VLAN_TAGS {
        if ethertype != ETHERTYPE_VLAN && ethertype != ETHERTYPE_QINQ {
            break;
        }
        offset += 4;
        ethertype = read_u16(frame, offset)?;
    }
    let l3 = offset + 2;

    match ethertype {
        ETHERTYPE_IPV4 => {
            let src: [u8; 4] = frame.get(l3 + 12..l3 + 16)?.try_into().ok()?;
            let dst: [u8; 4] = frame.get(l3 + 16..l3 + 20)?.try_into().ok()?;
            Some(L3Endpoints {
                src: Ipv4Addr::from(src).into(),
                dst: Ipv4Addr::from(dst).into(),
            })
        }
        ETHERTYPE_IPV6 => {
            let src: [u8; 16] = frame.get(l3 + 8..l3 + 24)?.try_into().ok()?;
            let dst: [u8; 16] = frame.get(l3 + 24..l3 + 40)?.try_into().ok()?;
            Some(L3Endpoints {
                src: Ipv6Addr::from(src).into(),
                dst: Ipv6Addr::from(dst).into(),
            })
        }
        _ => None,
    }
}

fn read_u16(frame: &[u8], offset: usize) -> Option<u16> {
    let bytes = frame.get(offset..offset + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// Device manager backed by fixed tables
///
/// `devices` maps an emulated host's IP to its MAC. `neighbors` is what the
/// network would answer to a resolution request; an entry only becomes
/// visible through [`neighbor_mac`](DeviceManager::neighbor_mac) after a
/// frame addressed to it has been resolved.
#[derive(Debug, Clone, Default)]
pub struct StaticDeviceTable {
    devices: HashMap<IpAddr, MacAddr>,
    neighbors: HashMap<IpAddr, MacAddr>,
    resolved: HashMap<IpAddr, MacAddr>,
}

impl StaticDeviceTable {
    pub fn new() -> Self {
        StaticDeviceTable::default()
    }

    /// Add an emulated device
    pub fn with_device(mut self, ip: IpAddr, mac: MacAddr) -> Self {
        self.devices.insert(ip, mac);
        self
    }

    /// Add a neighbor the network can resolve
    pub fn with_neighbor(mut self, ip: IpAddr, mac: MacAddr) -> Self {
        self.neighbors.insert(ip, mac);
        self
    }

    /// Number of neighbors resolved so far
    pub fn resolved_count(&self) -> usize {
        self.resolved.len()
    }
}

impl DeviceManager for StaticDeviceTable {
    fn resolve_neighbors(&mut self, frame: &[u8]) {
        let Some(endpoints) = l3_endpoints(frame) else {
            return;
        };
        match self.neighbors.get(&endpoints.dst) {
            Some(&mac) => {
                self.resolved.insert(endpoints.dst, mac);
            }
            None => tracing::debug!("No neighbor answers for {}", endpoints.dst),
        }
    }

    fn clear_neighbors(&mut self) {
        self.resolved.clear();
    }

    fn device_mac(&self, frame: &[u8]) -> Option<MacAddr> {
        let endpoints = l3_endpoints(frame)?;
        self.devices.get(&endpoints.src).copied()
    }

    fn neighbor_mac(&self, frame: &[u8]) -> Option<MacAddr> {
        let endpoints = l3_endpoints(frame)?;
        self.resolved.get(&endpoints.dst).copied()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Minimal Ethernet + IPv4 + UDP frame
    pub(crate) fn ipv4_frame(src: [u8; 4], dst: [u8; 4], vlan: bool) -> Vec<u8> {
        let mut frame = vec![0xFF; 6];
        frame.extend_from_slice(&[0x02, 0, 0, 0, 0, 1]);
        if vlan {
            frame.extend_from_slice(&ETHERTYPE_VLAN.to_be_bytes());
            frame.extend_from_slice(&[0x00, 0x64]);
        }
        frame.extend_from_slice(&ETHERTYPE_IPV4.to_be_bytes());

        let mut ip = vec![0u8; 20];
        ip[0] = 0x45;
        ip[9] = 17;
        ip[12..16].copy_from_slice(&src);
        ip[16..20].copy_from_slice(&dst);
        frame.extend_from_slice(&ip);
        frame.extend_from_slice(&[0u8; 8]);
        frame
    }

    const DEV_MAC: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x10]);
    const GW_MAC: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x20]);

    fn table() -> StaticDeviceTable {
        StaticDeviceTable::new()
            .with_device(IpAddr::from([10, 0, 0, 1]), DEV_MAC)
            .with_neighbor(IpAddr::from([10, 0, 0, 254]), GW_MAC)
    }

    #[test]
    fn test_l3_endpoints() {
        let frame = ipv4_frame([10, 0, 0, 1], [10, 0, 0, 254], false);
        let endpoints = l3_endpoints(&frame).unwrap();
        assert_eq!(endpoints.src, IpAddr::from([10, 0, 0, 1]));
        assert_eq!(endpoints.dst, IpAddr::from([10, 0, 0, 254]));

        let tagged = ipv4_frame([10, 0, 0, 1], [10, 0, 0, 254], true);
        assert_eq!(l3_endpoints(&tagged), Some(endpoints));
    }

    /// Insert `tags` alternating 802.1ad / 802.1Q headers after the MACs
    fn with_vlan_tags(untagged: Vec<u8>, tags: usize) -> Vec<u8> {
        let mut frame = untagged[..12].to_vec();
        for i in 0..tags {
            let tpid = if i % 2 == 0 { ETHERTYPE_QINQ } else { ETHERTYPE_VLAN };
            frame.extend_from_slice(&tpid.to_be_bytes());
            frame.extend_from_slice(&(100 + i as u16).to_be_bytes());
        }
        frame.extend_from_slice(&untagged[12..]);
        frame
    }

    fn ipv6_frame(src: Ipv6Addr, dst: Ipv6Addr) -> Vec<u8> {
        let mut frame = vec![0u8; 12];
        frame.extend_from_slice(&ETHERTYPE_IPV6.to_be_bytes());
        let mut ip = vec![0u8; 40];
        ip[0] = 0x60;
        ip[8..24].copy_from_slice(&src.octets());
        ip[24..40].copy_from_slice(&dst.octets());
        frame.extend_from_slice(&ip);
        frame
    }

    #[test]
    fn test_stacked_vlan_tags() {
        let plain = ipv4_frame([10, 0, 0, 1], [10, 0, 0, 254], false);
        let expected = l3_endpoints(&plain);
        assert!(expected.is_some());

        for tags in 1..=MAX_VLAN_TAGS {
            let frame = with_vlan_tags(plain.clone(), tags);
            assert_eq!(l3_endpoints(&frame), expected, "{} tags", tags);
        }

        // One tag too many is not followed
        let frame = with_vlan_tags(plain, MAX_VLAN_TAGS + 1);
        assert!(l3_endpoints(&frame).is_none());
    }

    #[test]
    fn test_four_tag_ipv6_fits_inspect_window() {
        let src: Ipv6Addr = "fe80::1".parse().unwrap();
        let dst: Ipv6Addr = "2001:db8::2".parse().unwrap();
        let frame = with_vlan_tags(ipv6_frame(src, dst), 4);
        assert_eq!(frame.len(), 70);

        let endpoints = l3_endpoints(&frame).unwrap();
        assert_eq!(endpoints.src, IpAddr::V6(src));
        assert_eq!(endpoints.dst, IpAddr::V6(dst));
    }

    #[test]
    fn test_three_tag_ipv4_resolves_neighbor() {
        let mut table = table();
        let frame = with_vlan_tags(ipv4_frame([10, 0, 0, 1], [10, 0, 0, 254], false), 3);

        table.resolve_neighbors(&frame);
        assert_eq!(table.device_mac(&frame), Some(DEV_MAC));
        assert_eq!(table.neighbor_mac(&frame), Some(GW_MAC));
    }

    #[test]
    fn test_non_ip_and_short_frames() {
        let mut arp = ipv4_frame([1, 1, 1, 1], [2, 2, 2, 2], false);
        arp[12..14].copy_from_slice(&0x0806u16.to_be_bytes());
        assert!(l3_endpoints(&arp).is_none());
        assert!(l3_endpoints(&[0u8; 20]).is_none());
    }

    #[test]
    fn test_ipv6_endpoints() {
        let mut frame = vec![0u8; 12];
        frame.extend_from_slice(&ETHERTYPE_IPV6.to_be_bytes());
        let mut ip = vec![0u8; 40];
        ip[8..24].copy_from_slice(&Ipv6Addr::LOCALHOST.octets());
        ip[24..40].copy_from_slice(&Ipv6Addr::UNSPECIFIED.octets());
        frame.extend_from_slice(&ip);

        let endpoints = l3_endpoints(&frame).unwrap();
        assert_eq!(endpoints.src, IpAddr::V6(Ipv6Addr::LOCALHOST));
    }

    #[test]
    fn test_neighbor_needs_resolution() {
        let mut table = table();
        let frame = ipv4_frame([10, 0, 0, 1], [10, 0, 0, 254], false);

        assert_eq!(table.device_mac(&frame), Some(DEV_MAC));
        assert_eq!(table.neighbor_mac(&frame), None);

        table.resolve_neighbors(&frame);
        assert_eq!(table.neighbor_mac(&frame), Some(GW_MAC));

        table.clear_neighbors();
        assert_eq!(table.neighbor_mac(&frame), None);
    }

    #[test]
    fn test_unknown_neighbor_stays_unresolved() {
        let mut table = table();
        let frame = ipv4_frame([10, 0, 0, 1], [192, 168, 1, 1], false);
        table.resolve_neighbors(&frame);
        assert_eq!(table.resolved_count(), 0);
    }

    #[test]
    fn test_mac_display() {
        assert_eq!(GW_MAC.to_string(), "02:00:00:00:00:20");
    }
}
