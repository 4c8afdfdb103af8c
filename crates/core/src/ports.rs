#![forbid(unsafe_code)]

use crate::detector::DetectorId;
use crate::types::Transport;
use std::collections::HashMap;
use std::io::{self, Write};

/// Well-known TLS wrapper ports and the cleartext service ports they carry.
/// Consulted only when the flow is being looked at post-decryption.
fn ssl_port_remap(port: u16) -> Option<u16> {
    match port {
        465 => Some(25),
        563 => Some(119),
        585 | 993 => Some(143),
        990 => Some(21),
        992 => Some(23),
        994 => Some(6667),
        995 => Some(110),
        _ => None,
    }
}

/// Which of the three port tables a binding lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortSide {
    Tcp,
    Udp,
    UdpReversed,
}

impl PortSide {
    pub fn from_transport(transport: Transport, reversed: bool) -> Self {
        match (transport, reversed) {
            (Transport::Tcp, _) => PortSide::Tcp,
            (Transport::Udp, false) => PortSide::Udp,
            (Transport::Udp, true) => PortSide::UdpReversed,
        }
    }
}

/// Port-indexed detector lists: one table per transport plus the
/// UDP-reversed table for registrations that identify the server from the
/// initiator side.
#[derive(Debug, Default)]
pub struct PortTable {
    tcp: HashMap<u16, Vec<DetectorId>>,
    udp: HashMap<u16, Vec<DetectorId>>,
    udp_reversed: HashMap<u16, Vec<DetectorId>>,
}

impl PortTable {
    pub fn new() -> Self {
        PortTable::default()
    }

    fn table(&self, side: PortSide) -> &HashMap<u16, Vec<DetectorId>> {
        match side {
            PortSide::Tcp => &self.tcp,
            PortSide::Udp => &self.udp,
            PortSide::UdpReversed => &self.udp_reversed,
        }
    }

    fn table_mut(&mut self, side: PortSide) -> &mut HashMap<u16, Vec<DetectorId>> {
        match side {
            PortSide::Tcp => &mut self.tcp,
            PortSide::Udp => &mut self.udp,
            PortSide::UdpReversed => &mut self.udp_reversed,
        }
    }

    /// Append `detector` to the port's list. Returns false when the binding
    /// already existed (duplicates are a no-op).
    pub fn add(&mut self, side: PortSide, port: u16, detector: DetectorId) -> bool {
        let list = self.table_mut(side).entry(port).or_default();
        if list.contains(&detector) {
            return false;
        }
        list.push(detector);
        true
    }

    /// Strip `detector` from every port list in all three tables. Returns
    /// how many bindings were removed.
    pub fn remove_all(&mut self, detector: DetectorId) -> u32 {
        let mut removed = 0;
        for side in [PortSide::Tcp, PortSide::Udp, PortSide::UdpReversed] {
            let table = self.table_mut(side);
            for list in table.values_mut() {
                let before = list.len();
                list.retain(|d| *d != detector);
                removed += (before - list.len()) as u32;
            }
            table.retain(|_, list| !list.is_empty());
        }
        removed
    }

    /// First (or next-after-`after`) detector registered for the port. With
    /// `ssl_decoded`, the port is reinterpreted through the TLS remap table
    /// and only the TCP table is consulted; unmapped ports yield nothing.
    pub fn next_by_port(
        &self,
        transport: Transport,
        port: u16,
        after: Option<DetectorId>,
        ssl_decoded: bool,
    ) -> Option<DetectorId> {
        let list = if ssl_decoded {
            self.tcp.get(&ssl_port_remap(port)?)?
        } else {
            match transport {
                Transport::Tcp => self.tcp.get(&port)?,
                Transport::Udp => self.udp.get(&port)?,
            }
        };
        match after {
            None => list.first().copied(),
            Some(last) => {
                let at = list.iter().position(|d| *d == last)?;
                list.get(at + 1).copied()
            }
        }
    }

    /// Head of the UDP-reversed list for a source port.
    pub fn reversed_first(&self, port: u16) -> Option<DetectorId> {
        self.udp_reversed.get(&port).and_then(|l| l.first()).copied()
    }

    pub fn binding_count(&self, detector: DetectorId) -> u32 {
        let mut count = 0;
        for side in [PortSide::Tcp, PortSide::Udp, PortSide::UdpReversed] {
            for list in self.table(side).values() {
                count += list.iter().filter(|d| **d == detector).count() as u32;
            }
        }
        count
    }

    /// Diagnostic port dump: one s-expression per transport listing the
    /// occupied ports.
    pub fn dump(&self, out: &mut dyn Write) -> io::Result<()> {
        for (label, table) in [("tcp", &self.tcp), ("udp", &self.udp)] {
            write!(out, "({label} ")?;
            let mut ports: Vec<u16> = table
                .iter()
                .filter(|(_, list)| !list.is_empty())
                .map(|(port, _)| *port)
                .collect();
            ports.sort_unstable();
            for (i, port) in ports.iter().enumerate() {
                if i != 0 {
                    write!(out, " ")?;
                }
                write!(out, "{port}")?;
            }
            writeln!(out, ") ")?;
        }
        Ok(())
    }
}
