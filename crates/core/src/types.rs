#![forbid(unsafe_code)]

use std::net::IpAddr;

/// Transport protocols the discovery engine understands. Registrations for
/// anything else are logged and skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Tcp,
    Udp,
}

/// Who sent the packet, relative to the flow's first packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Initiator,
    Responder,
}

/// Outcome of a validation pass or of a full `discover` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceVerdict {
    Success,
    InProcess,
    NotCompatible,
    Fail,
    NoMatch,
    Invalid,
    OutOfMemory,
}

/// Application identifier a detector reports on commit.
pub type AppId = u32;

/// A parsed packet as handed in by the capture pipeline. The payload is
/// borrowed; nothing here outlives the packet.
#[derive(Debug, Clone, Copy)]
pub struct PacketView<'a> {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub transport: Transport,
    pub payload: &'a [u8],
}

impl<'a> PacketView<'a> {
    /// Server-side endpoint as seen from this packet's direction.
    pub fn server_endpoint(&self, dir: Direction) -> (IpAddr, u16) {
        match dir {
            Direction::Responder => (self.src_ip, self.src_port),
            Direction::Initiator => (self.dst_ip, self.dst_port),
        }
    }

    /// Client-side endpoint, the opposite of `server_endpoint`.
    pub fn client_endpoint(&self, dir: Direction) -> (IpAddr, u16) {
        match dir {
            Direction::Responder => (self.dst_ip, self.dst_port),
            Direction::Initiator => (self.src_ip, self.src_port),
        }
    }
}
