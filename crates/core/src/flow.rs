#![forbid(unsafe_code)]

use crate::detector::DetectorId;
use crate::host::HostKey;
use crate::types::{AppId, Direction, PacketView};
use std::any::Any;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};

pub const MAX_CANDIDATES: usize = 10;

const DHCP_OPTION55_LEN_MAX: usize = 255;
const DHCP_OPTION_COPY_MAX: usize = 64;

/// Sub-protocol detail a detector attaches on commit (e.g. an RPC program
/// under the portmapper).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceSubtype {
    pub service: Option<String>,
    pub vendor: Option<String>,
    pub version: Option<String>,
}

/// DHCP option fingerprint captured off a flow, at most once.
#[derive(Debug, Clone, Default)]
pub struct DhcpFingerprint {
    pub op55: Vec<u8>,
    pub op60: Vec<u8>,
    pub mac: [u8; 6],
}

/// Lease data reported by a DHCP detector; pooled between flows.
#[derive(Debug, Clone)]
pub struct DhcpLease {
    pub ip: Ipv4Addr,
    pub mac: [u8; 6],
    pub netmask: u32,
    pub lease_secs: u32,
    pub router: u32,
}

impl Default for DhcpLease {
    fn default() -> Self {
        DhcpLease {
            ip: Ipv4Addr::new(0, 0, 0, 0),
            mac: [0; 6],
            netmask: 0,
            lease_secs: 0,
            router: 0,
        }
    }
}

/// SMB dialect fingerprint; pooled between flows.
#[derive(Debug, Clone, Default)]
pub struct SmbInfo {
    pub major: u32,
    pub minor: u32,
    pub flags: u32,
}

/// Everything the discovery engine tracks per flow: the committed detector,
/// the candidate walk, the resolved server endpoint, and the side-channel
/// payloads detectors leave behind.
#[derive(Default)]
pub struct FlowContext {
    pub chosen: Option<DetectorId>,
    pub candidates: Vec<DetectorId>,
    pub candidates_tried: u32,
    pub candidates_active: bool,
    pub host_key: Option<HostKey>,
    pub service_ip: Option<IpAddr>,
    pub service_port: Option<u16>,
    pub initiator_ip: Option<IpAddr>,
    pub responder_ip: Option<IpAddr>,

    pub app_id: Option<AppId>,
    pub misc_app_id: Option<AppId>,
    pub vendor: Option<String>,
    pub version: Option<String>,
    pub subtypes: Vec<ServiceSubtype>,

    pub service_detected: bool,
    pub continue_monitoring: bool,
    pub ignore_host: bool,
    pub udp_reversed: bool,
    pub incompatible: bool,
    pub additional_packet: bool,
    pub tried_reverse_service: bool,
    pub got_incompatible: bool,

    pub dhcp_fingerprint: Option<Box<DhcpFingerprint>>,
    pub dhcp_lease: Option<Box<DhcpLease>>,
    pub smb_info: Option<Box<SmbInfo>>,

    data: HashMap<u32, Box<dyn Any>>,
}

impl FlowContext {
    pub fn new() -> Self {
        FlowContext::default()
    }

    /// Record which side initiated the flow, once, so teardown can still
    /// name the client after the packet is gone.
    pub fn note_endpoints(&mut self, pkt: &PacketView, dir: Direction) {
        if self.initiator_ip.is_none() {
            let (client, _) = pkt.client_endpoint(dir);
            let (server, _) = pkt.server_endpoint(dir);
            self.initiator_ip = Some(client);
            self.responder_ip = Some(server);
        }
    }

    /// The endpoint that is not the service side; what the failure handler
    /// counts against.
    pub fn client_ip(&self) -> Option<IpAddr> {
        let service = self.service_ip?;
        if self.initiator_ip == Some(service) {
            self.responder_ip
        } else {
            self.initiator_ip
        }
    }

    /// Stash a detector's keyed scratch blob. Refuses to clobber an
    /// occupied slot.
    pub fn data_add(&mut self, key: u32, blob: Box<dyn Any>) -> bool {
        if self.data.contains_key(&key) {
            return false;
        }
        self.data.insert(key, blob);
        true
    }

    pub fn data_get(&self, key: u32) -> Option<&dyn Any> {
        self.data.get(&key).map(|b| b.as_ref())
    }

    pub fn data_get_mut(&mut self, key: u32) -> Option<&mut (dyn Any + 'static)> {
        self.data.get_mut(&key).map(|b| b.as_mut())
    }

    pub fn data_remove(&mut self, key: u32) -> bool {
        self.data.remove(&key).is_some()
    }

    /// Record a DHCP option fingerprint. Only the first one per flow sticks;
    /// oversized option lists are rejected, long values truncated.
    pub fn set_dhcp_fingerprint(&mut self, op55: &[u8], op60: &[u8], mac: [u8; 6]) -> bool {
        if op55.is_empty() || op55.len() > DHCP_OPTION55_LEN_MAX || self.dhcp_fingerprint.is_some()
        {
            return false;
        }
        self.dhcp_fingerprint = Some(Box::new(DhcpFingerprint {
            op55: op55[..op55.len().min(DHCP_OPTION_COPY_MAX)].to_vec(),
            op60: op60[..op60.len().min(DHCP_OPTION_COPY_MAX)].to_vec(),
            mac,
        }));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Transport;

    fn pkt(payload: &[u8]) -> PacketView<'_> {
        PacketView {
            src_ip: "1.2.3.4".parse().unwrap(),
            dst_ip: "5.6.7.8".parse().unwrap(),
            src_port: 40000,
            dst_port: 21,
            transport: Transport::Tcp,
            payload,
        }
    }

    #[test]
    fn keyed_scratch_round_trips() {
        let mut flow = FlowContext::new();
        assert!(flow.data_add(7, Box::new(41u32)));
        assert!(!flow.data_add(7, Box::new(42u32)));
        let v = flow.data_get(7).and_then(|b| b.downcast_ref::<u32>());
        assert_eq!(v, Some(&41));
        assert!(flow.data_remove(7));
        assert!(!flow.data_remove(7));
        assert!(flow.data_get(7).is_none());
    }

    #[test]
    fn endpoints_pin_to_the_first_packet() {
        let mut flow = FlowContext::new();
        flow.note_endpoints(&pkt(b""), Direction::Initiator);
        assert_eq!(flow.initiator_ip, Some("1.2.3.4".parse().unwrap()));
        assert_eq!(flow.responder_ip, Some("5.6.7.8".parse().unwrap()));

        // A later responder-direction packet must not flip them.
        let mut reply = pkt(b"");
        std::mem::swap(&mut reply.src_ip, &mut reply.dst_ip);
        flow.note_endpoints(&reply, Direction::Responder);
        assert_eq!(flow.initiator_ip, Some("1.2.3.4".parse().unwrap()));
    }

    #[test]
    fn client_ip_is_the_non_service_side() {
        let mut flow = FlowContext::new();
        flow.note_endpoints(&pkt(b""), Direction::Initiator);
        flow.service_ip = Some("5.6.7.8".parse().unwrap());
        assert_eq!(flow.client_ip(), Some("1.2.3.4".parse().unwrap()));

        // UDP-reversed style: the initiator turned out to be the server.
        flow.service_ip = Some("1.2.3.4".parse().unwrap());
        assert_eq!(flow.client_ip(), Some("5.6.7.8".parse().unwrap()));
    }

    #[test]
    fn dhcp_fingerprint_sticks_once() {
        let mut flow = FlowContext::new();
        assert!(flow.set_dhcp_fingerprint(&[1, 3, 6], &[], [1, 2, 3, 4, 5, 6]));
        assert!(!flow.set_dhcp_fingerprint(&[9], &[], [1, 2, 3, 4, 5, 6]));
        assert_eq!(flow.dhcp_fingerprint.as_ref().unwrap().op55, vec![1, 3, 6]);

        let mut other = FlowContext::new();
        assert!(!other.set_dhcp_fingerprint(&[], &[], [0; 6]));
        let long = vec![0u8; 300];
        assert!(!other.set_dhcp_fingerprint(&long, &[], [0; 6]));
    }
}
