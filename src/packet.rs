//! Packet and header model.
//!
//! Byte-level codecs live below the engine; the simulator moves structured
//! headers around and only accounts for their on-wire sizes. `Packet` is
//! built bottom-up the way the device stacks headers, `ParsedHeader` is the
//! demuxed view the device hands upward on receive.

use crate::{
    constants::{
        CNP_HEADER_LEN, INT_HOP_LEN, IPV4_HEADER_LEN, MAX_HOP, PPP_HEADER_LEN, PPP_PROTO_IPV4,
        PPP_PROTO_IPV6, PROTO_ACK, PROTO_CNP, PROTO_NACK, PROTO_UDP, QBB_FLAG_CNP,
        QBB_HEADER_BASE_LEN, SEQ_TS_HEADER_LEN, UDP_HEADER_LEN,
    },
    error::{HostError, Result},
    rate::DataRate,
};

/// One hop of in-band network telemetry, as switches stamp it.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IntHop {
    /// Egress queue length in bytes
    pub qlen: u32,
    /// Cumulative transmitted bytes counter
    pub tx_bytes: u64,
    /// Stamp time in nanoseconds
    pub ts: u64,
    /// Egress line rate
    pub line_rate: DataRate,
}

impl IntHop {
    pub fn new(qlen: u32, tx_bytes: u64, ts: u64, line_rate: DataRate) -> Self {
        Self {
            qlen,
            tx_bytes,
            ts,
            line_rate,
        }
    }

    /// Nanoseconds elapsed since `prev` was stamped at the same hop.
    pub fn time_delta(&self, prev: &IntHop) -> u64 {
        self.ts.wrapping_sub(prev.ts)
    }

    /// Bytes transmitted since `prev` was stamped at the same hop.
    pub fn bytes_delta(&self, prev: &IntHop) -> u64 {
        self.tx_bytes.wrapping_sub(prev.tx_bytes)
    }
}

/// In-band telemetry carried by data packets and echoed on ACKs.
///
/// The three feedback forms (per-hop INT, TIMELY send timestamp, PINT
/// compressed power) share the header; the active CC mode decides which
/// field is meaningful.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IntHeader {
    nhop: u8,
    hop: [IntHop; MAX_HOP],
    /// Sender timestamp (ns) for RTT-gradient feedback
    pub ts: u64,
    /// PINT compressed path utilisation
    pub power: u16,
}

impl IntHeader {
    /// Header carrying only the sender timestamp, as data packets leave the
    /// host before any switch has stamped a hop.
    pub fn timestamped(ts: u64) -> IntHeader {
        IntHeader {
            ts,
            ..IntHeader::default()
        }
    }

    /// Header carrying a compressed PINT utilisation code.
    pub fn pint(power: u16) -> IntHeader {
        IntHeader {
            power,
            ..IntHeader::default()
        }
    }

    /// Appends a hop record; returns false once the hop budget is used up.
    pub fn push_hop(&mut self, hop: IntHop) -> bool {
        let n = usize::from(self.nhop);
        if n >= MAX_HOP {
            return false;
        }
        self.hop[n] = hop;
        self.nhop += 1;
        true
    }

    pub fn hops(&self) -> &[IntHop] {
        &self.hop[..usize::from(self.nhop)]
    }

    pub fn n_hop(&self) -> usize {
        usize::from(self.nhop)
    }

    pub fn serialized_size() -> u32 {
        4 + MAX_HOP as u32 * INT_HOP_LEN
    }
}

/// Sequence header of data packets: seq(64) + pg(16).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SeqTsHeader {
    pub seq: u64,
    pub pg: u16,
    pub ih: IntHeader,
}

impl SeqTsHeader {
    pub fn serialized_size() -> u32 {
        SEQ_TS_HEADER_LEN + IntHeader::serialized_size()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UdpHeader {
    pub sport: u16,
    pub dport: u16,
}

impl UdpHeader {
    pub fn serialized_size() -> u32 {
        UDP_HEADER_LEN
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    pub src: u32,
    pub dst: u32,
    pub protocol: u8,
    pub ttl: u8,
    pub tos: u8,
    /// ECN codepoint; non-zero means the packet was marked
    pub ecn: u8,
    pub identification: u16,
    pub payload_size: u32,
}

impl Ipv4Header {
    pub fn serialized_size() -> u32 {
        IPV4_HEADER_LEN
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PppHeader {
    pub protocol: u16,
}

impl PppHeader {
    pub fn serialized_size() -> u32 {
        PPP_HEADER_LEN
    }
}

/// Maps an Ethertype onto the point-to-point PPP protocol code.
/// Anything but IPv4/IPv6 is a fatal encoding fault.
pub fn ether_to_ppp(proto: u16) -> Result<u16> {
    match proto {
        0x0800 => Ok(PPP_PROTO_IPV4),
        0x86DD => Ok(PPP_PROTO_IPV6),
        other => Err(HostError::UnknownEthertype(other)),
    }
}

/// Control header of ACK/NACK packets.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct QbbHeader {
    pub seq: u64,
    pub pg: u16,
    pub sport: u16,
    pub dport: u16,
    pub flags: u16,
    pub ih: IntHeader,
}

impl QbbHeader {
    pub fn set_cnp(&mut self) {
        self.flags |= 1 << QBB_FLAG_CNP;
    }

    pub fn is_cnp(&self) -> bool {
        (self.flags >> QBB_FLAG_CNP) & 1 == 1
    }

    pub fn serialized_size() -> u32 {
        QBB_HEADER_BASE_LEN + IntHeader::serialized_size()
    }
}

/// Congestion notification header.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CnpHeader {
    /// Queue (priority group) index the mark was observed on
    pub qindex: u16,
    /// Flow id: the original source port of the marked flow
    pub fid: u16,
    pub ecn_bits: u8,
    /// Marked-packet count in the feedback window
    pub qfb: u16,
    /// Total packet count in the feedback window
    pub total: u16,
}

impl CnpHeader {
    pub fn serialized_size() -> u32 {
        CNP_HEADER_LEN
    }
}

/// A simulated frame: a payload byte count plus the stacked headers.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Packet {
    payload: u32,
    pub seq_ts: Option<SeqTsHeader>,
    pub udp: Option<UdpHeader>,
    pub qbb: Option<QbbHeader>,
    pub cnp: Option<CnpHeader>,
    pub ipv4: Option<Ipv4Header>,
    pub ppp: Option<PppHeader>,
}

impl Packet {
    pub fn new(payload: u32) -> Self {
        Packet {
            payload,
            ..Packet::default()
        }
    }

    pub fn payload_size(&self) -> u32 {
        self.payload
    }

    /// Total frame size: payload plus every header pushed so far.
    pub fn size(&self) -> u32 {
        let mut size = self.payload;
        if self.seq_ts.is_some() {
            size += SeqTsHeader::serialized_size();
        }
        if self.udp.is_some() {
            size += UdpHeader::serialized_size();
        }
        if self.qbb.is_some() {
            size += QbbHeader::serialized_size();
        }
        if self.cnp.is_some() {
            size += CnpHeader::serialized_size();
        }
        if self.ipv4.is_some() {
            size += Ipv4Header::serialized_size();
        }
        if self.ppp.is_some() {
            size += PppHeader::serialized_size();
        }
        size
    }

    pub fn add_seq_ts(&mut self, h: SeqTsHeader) {
        self.seq_ts = Some(h);
    }

    pub fn add_udp(&mut self, h: UdpHeader) {
        self.udp = Some(h);
    }

    pub fn add_qbb(&mut self, h: QbbHeader) {
        self.qbb = Some(h);
    }

    pub fn add_cnp(&mut self, h: CnpHeader) {
        self.cnp = Some(h);
    }

    pub fn add_ipv4(&mut self, h: Ipv4Header) {
        self.ipv4 = Some(h);
    }

    pub fn add_ppp(&mut self, h: PppHeader) {
        self.ppp = Some(h);
    }
}

/// L4 view of a received packet, demuxed by L3 protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L4Header {
    Udp {
        sport: u16,
        dport: u16,
        pg: u16,
        seq: u64,
        ih: IntHeader,
    },
    Ack(QbbHeader),
    Cnp(CnpHeader),
}

/// Parsed view the device hands the engine together with the packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedHeader {
    pub sip: u32,
    pub dip: u32,
    pub l3_prot: u8,
    pub ecn_bits: u8,
    pub tos: u8,
    pub l4: L4Header,
}

impl ParsedHeader {
    /// Rebuilds the parsed view from a packet's structured headers. This is
    /// what the link layer does below the engine; exposed here so tests and
    /// loopback harnesses can close the loop.
    pub fn from_packet(pkt: &Packet) -> Option<ParsedHeader> {
        let ip = pkt.ipv4?;
        let l4 = match ip.protocol {
            PROTO_UDP => {
                let seq_ts = pkt.seq_ts?;
                let udp = pkt.udp?;
                L4Header::Udp {
                    sport: udp.sport,
                    dport: udp.dport,
                    pg: seq_ts.pg,
                    seq: seq_ts.seq,
                    ih: seq_ts.ih,
                }
            }
            PROTO_ACK | PROTO_NACK => L4Header::Ack(pkt.qbb?),
            PROTO_CNP => L4Header::Cnp(pkt.cnp?),
            _ => return None,
        };
        Some(ParsedHeader {
            sip: ip.src,
            dip: ip.dst,
            l3_prot: ip.protocol,
            ecn_bits: ip.ecn,
            tos: ip.tos,
            l4,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ether_to_ppp_mapping() {
        assert_eq!(ether_to_ppp(0x0800).unwrap(), PPP_PROTO_IPV4);
        assert_eq!(ether_to_ppp(0x86DD).unwrap(), PPP_PROTO_IPV6);
        assert!(matches!(
            ether_to_ppp(0x0806),
            Err(HostError::UnknownEthertype(0x0806))
        ));
    }

    #[test]
    fn int_header_hop_budget() {
        let mut ih = IntHeader::default();
        for i in 0..MAX_HOP {
            assert!(ih.push_hop(IntHop::new(i as u32, 0, 0, DataRate::ZERO)));
        }
        assert!(!ih.push_hop(IntHop::default()));
        assert_eq!(ih.n_hop(), MAX_HOP);
        assert_eq!(ih.hops()[2].qlen, 2);
    }

    #[test]
    fn packet_size_accounts_for_headers() {
        let mut pkt = Packet::new(1000);
        assert_eq!(pkt.size(), 1000);
        pkt.add_seq_ts(SeqTsHeader::default());
        pkt.add_udp(UdpHeader::default());
        pkt.add_ipv4(Ipv4Header::default());
        pkt.add_ppp(PppHeader {
            protocol: PPP_PROTO_IPV4,
        });
        assert_eq!(
            pkt.size(),
            1000
                + SeqTsHeader::serialized_size()
                + UdpHeader::serialized_size()
                + Ipv4Header::serialized_size()
                + PppHeader::serialized_size()
        );
    }

    #[test]
    fn parse_round_trips_the_udp_view() {
        let mut pkt = Packet::new(1000);
        pkt.add_seq_ts(SeqTsHeader {
            seq: 9000,
            pg: 3,
            ih: IntHeader::default(),
        });
        pkt.add_udp(UdpHeader {
            sport: 100,
            dport: 200,
        });
        pkt.add_ipv4(Ipv4Header {
            src: 0x0b000001,
            dst: 0x0b000101,
            protocol: PROTO_UDP,
            ttl: 64,
            ecn: 0b11,
            ..Ipv4Header::default()
        });
        let ch = ParsedHeader::from_packet(&pkt).unwrap();
        assert_eq!(ch.l3_prot, PROTO_UDP);
        assert_eq!(ch.ecn_bits, 0b11);
        match ch.l4 {
            L4Header::Udp {
                sport,
                dport,
                pg,
                seq,
                ..
            } => {
                assert_eq!((sport, dport, pg, seq), (100, 200, 3, 9000));
            }
            _ => panic!("expected UDP view"),
        }
    }
}
