//! ICMP echo probing.
//!
//! Each echo request carries its send time as microseconds since a process-local epoch, so the
//! round-trip time is computed from the reply alone. Only IPv4 targets are supported.

use std::{
    io,
    net::{IpAddr, Ipv4Addr, ToSocketAddrs},
    sync::OnceLock,
    time::{Duration, Instant},
};

use pnet::{
    packet::{
        icmp::{
            echo_reply::EchoReplyPacket, echo_request::MutableEchoRequestPacket, IcmpPacket,
            IcmpTypes,
        },
        ip::IpNextHeaderProtocols,
        Packet,
    },
    transport::{
        icmp_packet_iter, transport_channel, TransportChannelType::Layer4, TransportProtocol::Ipv4,
        TransportReceiver, TransportSender,
    },
    util::checksum,
};

use crate::{Error, Result};

const ECHO_HEADER_LEN: usize = 8;
const PAYLOAD_LEN: usize = 56;
const CHANNEL_BUFFER: usize = 4096;

/// A matched echo reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EchoReply {
    pub sequence: u16,
    pub rtt: Duration,
}

/// Sends latency probes and waits for their replies.
pub trait Prober: Send {
    /// Sends one probe with the given sequence number.
    fn send(&mut self, sequence: u16) -> io::Result<()>;

    /// Waits up to `timeout` for a reply to one of our probes. `Ok(None)` on timeout.
    fn recv(&mut self, timeout: Duration) -> io::Result<Option<EchoReply>>;
}

fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

fn now_micros() -> u64 {
    epoch().elapsed().as_micros() as u64
}

/// Resolves `host` to its first IPv4 address.
pub fn resolve_ipv4(host: &str) -> Result<Ipv4Addr> {
    if let Ok(addr) = host.parse::<Ipv4Addr>() {
        return Ok(addr);
    }

    (host, 0)
        .to_socket_addrs()
        .map_err(|e| Error::Resolve(format!("{host}: {e}")))?
        .find_map(|addr| match addr.ip() {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(_) => None,
        })
        .ok_or_else(|| Error::Resolve(format!("{host}: no IPv4 address")))
}

/// Builds an echo request stamped with `sent_us`.
pub fn echo_request(identifier: u16, sequence: u16, sent_us: u64) -> Vec<u8> {
    let mut buf = vec![0u8; ECHO_HEADER_LEN + PAYLOAD_LEN];
    if let Some(mut packet) = MutableEchoRequestPacket::new(&mut buf) {
        let mut payload = [0u8; PAYLOAD_LEN];
        payload[..8].copy_from_slice(&sent_us.to_be_bytes());

        packet.set_icmp_type(IcmpTypes::EchoRequest);
        packet.set_identifier(identifier);
        packet.set_sequence_number(sequence);
        packet.set_payload(&payload);
        let sum = checksum(packet.packet(), 1);
        packet.set_checksum(sum);
    }
    buf
}

/// Extracts `(identifier, sequence, sent_us)` from an echo reply.
pub fn parse_echo_reply(icmp: &IcmpPacket<'_>) -> Option<(u16, u16, u64)> {
    if icmp.get_icmp_type() != IcmpTypes::EchoReply {
        return None;
    }
    let reply = EchoReplyPacket::new(icmp.packet())?;
    let stamp: [u8; 8] = reply.payload().get(..8)?.try_into().ok()?;

    Some((reply.get_identifier(), reply.get_sequence_number(), u64::from_be_bytes(stamp)))
}

/// Probes an IPv4 host over a raw ICMP socket. Needs `CAP_NET_RAW`.
pub struct IcmpProber {
    target: Ipv4Addr,
    identifier: u16,
    tx: TransportSender,
    rx: TransportReceiver,
}

impl std::fmt::Debug for IcmpProber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IcmpProber")
            .field("target", &self.target)
            .field("identifier", &self.identifier)
            .finish()
    }
}

impl IcmpProber {
    pub fn new(target: Ipv4Addr) -> Result<Self> {
        let (tx, rx) =
            transport_channel(CHANNEL_BUFFER, Layer4(Ipv4(IpNextHeaderProtocols::Icmp)))?;

        Ok(Self { target, identifier: (std::process::id() & 0xFFFF) as u16, tx, rx })
    }

    pub fn target(&self) -> Ipv4Addr {
        self.target
    }
}

impl Prober for IcmpProber {
    fn send(&mut self, sequence: u16) -> io::Result<()> {
        let buf = echo_request(self.identifier, sequence, now_micros());
        let packet = IcmpPacket::new(&buf)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "short echo request"))?;

        self.tx.send_to(packet, IpAddr::V4(self.target))?;
        tracing::trace!(sequence, target = %self.target, "probe sent");
        Ok(())
    }

    fn recv(&mut self, timeout: Duration) -> io::Result<Option<EchoReply>> {
        let deadline = Instant::now() + timeout;
        let mut iter = icmp_packet_iter(&mut self.rx);

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }

            let Some((icmp, from)) = iter.next_with_timeout(remaining)? else {
                return Ok(None);
            };
            if from != IpAddr::V4(self.target) {
                continue;
            }

            match parse_echo_reply(&icmp) {
                Some((identifier, sequence, sent_us)) if identifier == self.identifier => {
                    let rtt = Duration::from_micros(now_micros().saturating_sub(sent_us));
                    return Ok(Some(EchoReply { sequence, rtt }));
                }
                _ => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_layout() {
        let buf = echo_request(0x1234, 7, 42);
        assert_eq!(buf.len(), 64);
        assert_eq!(buf[0], 8);
        assert_eq!(&buf[4..6], &[0x12, 0x34]);
        assert_eq!(&buf[6..8], &[0, 7]);
        assert_eq!(&buf[8..16], &42u64.to_be_bytes());
        assert_eq!(u16::from_be_bytes([buf[2], buf[3]]), checksum(&buf, 1));
    }

    #[test]
    fn parses_reply() {
        let mut buf = echo_request(9, 3, 1_000);
        buf[0] = 0;
        let icmp = IcmpPacket::new(&buf).unwrap();
        assert_eq!(parse_echo_reply(&icmp), Some((9, 3, 1_000)));

        let request = echo_request(9, 3, 1_000);
        assert_eq!(parse_echo_reply(&IcmpPacket::new(&request).unwrap()), None);
    }

    #[test]
    fn resolves_literal() {
        assert_eq!(resolve_ipv4("192.0.2.1").unwrap(), Ipv4Addr::new(192, 0, 2, 1));
    }
}
