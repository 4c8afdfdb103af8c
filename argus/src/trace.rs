#![forbid(unsafe_code)]

use argus_core::{Direction, Transport};
use std::net::IpAddr;

/// One replay line:
/// `<i|r> <tcp|udp> <src_ip>:<sport> <dst_ip>:<dport> [hex payload]`
#[derive(Debug, Clone)]
pub struct TracePacket {
    pub dir: Direction,
    pub transport: Transport,
    pub src: IpAddr,
    pub src_port: u16,
    pub dst: IpAddr,
    pub dst_port: u16,
    pub payload: Vec<u8>,
}

/// Direction-insensitive flow identity for sharding and bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowId {
    pub transport_tcp: bool,
    pub low: (IpAddr, u16),
    pub high: (IpAddr, u16),
}

impl TracePacket {
    pub fn flow_id(&self) -> FlowId {
        let a = (self.src, self.src_port);
        let b = (self.dst, self.dst_port);
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        FlowId {
            transport_tcp: self.transport == Transport::Tcp,
            low,
            high,
        }
    }
}

/// Payload fields are bare hex runs; whitespace already split them off, so
/// anything that is not an even count of hex digits is a broken line.
fn decode_payload(field: &str, lineno: usize) -> Result<Vec<u8>, String> {
    if !field.is_ascii() || field.len() % 2 != 0 {
        return Err(format!(
            "line {lineno}: payload must be an even run of hex digits"
        ));
    }
    let mut payload = Vec::with_capacity(field.len() / 2);
    for at in (0..field.len()).step_by(2) {
        let byte = u8::from_str_radix(&field[at..at + 2], 16).map_err(|_| {
            format!(
                "line {lineno}: bad payload byte {:?} at offset {at}",
                &field[at..at + 2]
            )
        })?;
        payload.push(byte);
    }
    Ok(payload)
}

fn parse_endpoint(field: &str, lineno: usize) -> Result<(IpAddr, u16), String> {
    let Some((ip, port)) = field.rsplit_once(':') else {
        return Err(format!("line {lineno}: expected <ip>:<port>, got {field}"));
    };
    let ip = ip
        .parse()
        .map_err(|_| format!("line {lineno}: invalid address {ip}"))?;
    let port = port
        .parse()
        .map_err(|_| format!("line {lineno}: invalid port {port}"))?;
    Ok((ip, port))
}

pub fn parse_trace(body: &str) -> Result<Vec<TracePacket>, String> {
    let mut packets = Vec::new();
    for (at, raw) in body.lines().enumerate() {
        let lineno = at + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split_whitespace();
        let (Some(dir), Some(transport), Some(src), Some(dst)) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            return Err(format!(
                "line {lineno}: expected <i|r> <tcp|udp> <src> <dst> [payload]"
            ));
        };
        let dir = match dir {
            "i" | "initiator" => Direction::Initiator,
            "r" | "responder" => Direction::Responder,
            other => return Err(format!("line {lineno}: unknown direction {other}")),
        };
        let transport = match transport {
            "tcp" => Transport::Tcp,
            "udp" => Transport::Udp,
            other => return Err(format!("line {lineno}: unknown transport {other}")),
        };
        let (src, src_port) = parse_endpoint(src, lineno)?;
        let (dst, dst_port) = parse_endpoint(dst, lineno)?;
        let payload = match fields.next() {
            Some(hex) => decode_payload(hex, lineno)?,
            None => Vec::new(),
        };
        if fields.next().is_some() {
            return Err(format!("line {lineno}: trailing fields after payload"));
        }
        packets.push(TracePacket {
            dir,
            transport,
            src,
            src_port,
            dst,
            dst_port,
            payload,
        });
    }
    Ok(packets)
}
