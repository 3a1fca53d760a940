//! Wire message formats and framing.
//!
//! Every frame is `magic(4) || command(12, null-padded ASCII) ||
//! payload_size(4, LE) || checksum(4, leading bytes of DSHA256(payload))
//! || payload`. Payloads use the canonical codec.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::constants::*;
use crate::error::NetError;
use crate::serialize::{
    decode_vec, encode_to_vec, encode_vec, Decodable, Encodable, Reader, Result as CodecResult,
};
use crate::types::{double_sha256, Block, BlockHeader, Hash, Transaction};

/// Network address as carried in `version` and `addr` payloads: services,
/// IPv6-mapped address bytes, and a big-endian port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetAddress {
    pub services: u64,
    pub ip: [u8; 16],
    pub port: u16,
}

impl NetAddress {
    pub fn from_socket(addr: SocketAddr, services: u64) -> Self {
        let ip = match addr.ip() {
            IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
            IpAddr::V6(v6) => v6.octets(),
        };
        NetAddress { services, ip, port: addr.port() }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        let v6 = Ipv6Addr::from(self.ip);
        match v6.to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(IpAddr::V4(v4), self.port),
            None => SocketAddr::new(IpAddr::V6(v6), self.port),
        }
    }

    fn ipv4(&self) -> Option<Ipv4Addr> {
        Ipv6Addr::from(self.ip).to_ipv4_mapped()
    }

    /// Routable means neither private (RFC1918), link-local (RFC3927),
    /// nor loopback.
    pub fn is_routable(&self) -> bool {
        match self.ipv4() {
            Some(v4) => {
                let o = v4.octets();
                let rfc1918 =
                    o[0] == 10 || (o[0] == 172 && (16..=31).contains(&o[1])) || (o[0] == 192 && o[1] == 168);
                let rfc3927 = o[0] == 169 && o[1] == 254;
                !(rfc1918 || rfc3927 || v4.is_loopback())
            }
            None => !Ipv6Addr::from(self.ip).is_loopback(),
        }
    }

    /// Deduplication key: `ip:port`.
    pub fn key(&self) -> String {
        format!("{}", self.socket_addr())
    }
}

impl Encodable for NetAddress {
    fn encode(&self, out: &mut Vec<u8>) {
        self.services.encode(out);
        self.ip.encode(out);
        out.extend_from_slice(&self.port.to_be_bytes());
    }

    fn encoded_size(&self) -> usize {
        26
    }
}

impl Decodable for NetAddress {
    fn decode(r: &mut Reader) -> CodecResult<Self> {
        let services = u64::decode(r)?;
        let ip = <[u8; 16]>::decode(r)?;
        let port_bytes = r.take(2)?;
        Ok(NetAddress { services, ip, port: u16::from_be_bytes([port_bytes[0], port_bytes[1]]) })
    }
}

/// Gossiped address with its last-seen time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimestampedAddress {
    pub last_seen: u32,
    pub address: NetAddress,
}

impl Encodable for TimestampedAddress {
    fn encode(&self, out: &mut Vec<u8>) {
        self.last_seen.encode(out);
        self.address.encode(out);
    }

    fn encoded_size(&self) -> usize {
        4 + self.address.encoded_size()
    }
}

impl Decodable for TimestampedAddress {
    fn decode(r: &mut Reader) -> CodecResult<Self> {
        Ok(TimestampedAddress { last_seen: Decodable::decode(r)?, address: Decodable::decode(r)? })
    }
}

/// Inventory object classes.
pub const INV_TX: u32 = 1;
pub const INV_BLOCK: u32 = 2;

/// One announced or requested object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvItem {
    pub kind: u32,
    pub hash: Hash,
}

impl InvItem {
    pub fn tx(hash: Hash) -> Self {
        InvItem { kind: INV_TX, hash }
    }

    pub fn block(hash: Hash) -> Self {
        InvItem { kind: INV_BLOCK, hash }
    }
}

impl Encodable for InvItem {
    fn encode(&self, out: &mut Vec<u8>) {
        self.kind.encode(out);
        self.hash.encode(out);
    }

    fn encoded_size(&self) -> usize {
        36
    }
}

impl Decodable for InvItem {
    fn decode(r: &mut Reader) -> CodecResult<Self> {
        Ok(InvItem { kind: Decodable::decode(r)?, hash: Decodable::decode(r)? })
    }
}

/// Handshake announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMessage {
    pub version: u32,
    pub services: u64,
    pub timestamp: u64,
    pub addr_recv: NetAddress,
    pub addr_from: NetAddress,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: u64,
}

impl Encodable for VersionMessage {
    fn encode(&self, out: &mut Vec<u8>) {
        self.version.encode(out);
        self.services.encode(out);
        self.timestamp.encode(out);
        self.addr_recv.encode(out);
        self.addr_from.encode(out);
        self.nonce.encode(out);
        self.user_agent.encode(out);
        self.start_height.encode(out);
    }
}

impl Decodable for VersionMessage {
    fn decode(r: &mut Reader) -> CodecResult<Self> {
        Ok(VersionMessage {
            version: Decodable::decode(r)?,
            services: Decodable::decode(r)?,
            timestamp: Decodable::decode(r)?,
            addr_recv: Decodable::decode(r)?,
            addr_from: Decodable::decode(r)?,
            nonce: Decodable::decode(r)?,
            user_agent: Decodable::decode(r)?,
            start_height: Decodable::decode(r)?,
        })
    }
}

/// Locator-based ancestry request (`getblocks` and `getheaders`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetBlocksMessage {
    pub version: u32,
    pub locator: Vec<Hash>,
    pub hash_stop: Hash,
}

impl Encodable for GetBlocksMessage {
    fn encode(&self, out: &mut Vec<u8>) {
        self.version.encode(out);
        encode_vec(out, &self.locator);
        self.hash_stop.encode(out);
    }
}

impl Decodable for GetBlocksMessage {
    fn decode(r: &mut Reader) -> CodecResult<Self> {
        Ok(GetBlocksMessage {
            version: Decodable::decode(r)?,
            locator: decode_vec(r)?,
            hash_stop: Decodable::decode(r)?,
        })
    }
}

/// The supported wire commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Version(VersionMessage),
    Verack,
    Addr(Vec<TimestampedAddress>),
    Inv(Vec<InvItem>),
    GetData(Vec<InvItem>),
    GetBlocks(GetBlocksMessage),
    GetHeaders(GetBlocksMessage),
    Headers(Vec<BlockHeader>),
    Tx(Transaction),
    Block(Block),
    Ping(u64),
    Pong(u64),
}

impl Message {
    pub fn command(&self) -> &'static str {
        match self {
            Message::Version(_) => "version",
            Message::Verack => "verack",
            Message::Addr(_) => "addr",
            Message::Inv(_) => "inv",
            Message::GetData(_) => "getdata",
            Message::GetBlocks(_) => "getblocks",
            Message::GetHeaders(_) => "getheaders",
            Message::Headers(_) => "headers",
            Message::Tx(_) => "tx",
            Message::Block(_) => "block",
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
        }
    }

    pub fn encode_payload(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Message::Version(v) => v.encode(&mut out),
            Message::Verack => {}
            Message::Addr(addrs) => encode_vec(&mut out, addrs),
            Message::Inv(items) | Message::GetData(items) => encode_vec(&mut out, items),
            Message::GetBlocks(g) | Message::GetHeaders(g) => g.encode(&mut out),
            Message::Headers(headers) => encode_vec(&mut out, headers),
            Message::Tx(tx) => tx.encode(&mut out),
            Message::Block(block) => block.encode(&mut out),
            Message::Ping(nonce) | Message::Pong(nonce) => nonce.encode(&mut out),
        }
        out
    }

    /// Decode a payload for `command`; the payload must be consumed
    /// entirely.
    pub fn decode_payload(command: &str, payload: &[u8]) -> Result<Message, NetError> {
        let mut r = Reader::new(payload);
        let message = match command {
            "version" => Message::Version(VersionMessage::decode(&mut r)?),
            "verack" => Message::Verack,
            "addr" => Message::Addr(decode_vec(&mut r)?),
            "inv" => Message::Inv(decode_vec(&mut r)?),
            "getdata" => Message::GetData(decode_vec(&mut r)?),
            "getblocks" => Message::GetBlocks(GetBlocksMessage::decode(&mut r)?),
            "getheaders" => Message::GetHeaders(GetBlocksMessage::decode(&mut r)?),
            "headers" => Message::Headers(decode_vec(&mut r)?),
            "tx" => Message::Tx(Transaction::decode(&mut r)?),
            "block" => Message::Block(Block::decode(&mut r)?),
            "ping" => Message::Ping(u64::decode(&mut r)?),
            "pong" => Message::Pong(u64::decode(&mut r)?),
            other => return Err(NetError::UnknownCommand(other.to_string())),
        };
        if !r.is_empty() {
            return Err(NetError::ProtocolViolation(format!(
                "{} trailing payload bytes after {command}",
                r.remaining()
            )));
        }
        Ok(message)
    }
}

/// Frame header: magic, command, payload length, checksum.
pub const FRAME_HEADER_SIZE: usize = 4 + COMMAND_SIZE + 4 + 4;

pub fn checksum(payload: &[u8]) -> [u8; 4] {
    let digest = double_sha256(payload);
    [digest[0], digest[1], digest[2], digest[3]]
}

/// Serialize a complete frame.
pub fn encode_frame(magic: [u8; 4], message: &Message) -> Vec<u8> {
    let payload = message.encode_payload();
    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    frame.extend_from_slice(&magic);
    let mut command = [0u8; COMMAND_SIZE];
    command[..message.command().len()].copy_from_slice(message.command().as_bytes());
    frame.extend_from_slice(&command);
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&checksum(&payload));
    frame.extend_from_slice(&payload);
    frame
}

/// Parsed frame header.
pub struct FrameHeader {
    pub command: String,
    pub payload_len: usize,
    pub checksum: [u8; 4],
}

/// Validate and split a frame header, checking magic and size bounds.
pub fn decode_frame_header(bytes: &[u8; FRAME_HEADER_SIZE], magic: [u8; 4]) -> Result<FrameHeader, NetError> {
    if bytes[..4] != magic {
        return Err(NetError::BadMagic);
    }
    let command_bytes = &bytes[4..4 + COMMAND_SIZE];
    let end = command_bytes.iter().position(|&b| b == 0).unwrap_or(COMMAND_SIZE);
    let command = std::str::from_utf8(&command_bytes[..end])
        .map_err(|_| NetError::ProtocolViolation("non-ascii command".into()))?
        .to_string();
    if command_bytes[end..].iter().any(|&b| b != 0) {
        return Err(NetError::ProtocolViolation("command not null-padded".into()));
    }
    let payload_len =
        u32::from_le_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]) as usize;
    if payload_len > MAX_MESSAGE_SIZE {
        return Err(NetError::OversizedPayload(payload_len as u64));
    }
    let checksum = [bytes[20], bytes[21], bytes[22], bytes[23]];
    Ok(FrameHeader { command, payload_len, checksum })
}

/// Verify a payload against its header checksum and decode it.
pub fn decode_frame_payload(header: &FrameHeader, payload: &[u8]) -> Result<Message, NetError> {
    if checksum(payload) != header.checksum {
        return Err(NetError::BadChecksum(header.command.clone()));
    }
    Message::decode_payload(&header.command, payload)
}

/// Convenience used by tests and the peer loop: encode then fully decode.
pub fn decode_frame(bytes: &[u8], magic: [u8; 4]) -> Result<(Message, usize), NetError> {
    if bytes.len() < FRAME_HEADER_SIZE {
        return Err(NetError::ConnectionClosed);
    }
    let mut header_bytes = [0u8; FRAME_HEADER_SIZE];
    header_bytes.copy_from_slice(&bytes[..FRAME_HEADER_SIZE]);
    let header = decode_frame_header(&header_bytes, magic)?;
    let total = FRAME_HEADER_SIZE + header.payload_len;
    if bytes.len() < total {
        return Err(NetError::ConnectionClosed);
    }
    let message = decode_frame_payload(&header, &bytes[FRAME_HEADER_SIZE..total])?;
    Ok((message, total))
}

pub fn unix_time() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_version() -> VersionMessage {
        let addr = NetAddress::from_socket("8.8.8.8:8171".parse().unwrap(), 1);
        VersionMessage {
            version: PROTOCOL_VERSION,
            services: 1,
            timestamp: 1_368_576_000,
            addr_recv: addr,
            addr_from: addr,
            nonce: 0x1122_3344_5566_7788,
            user_agent: "/aurum:0.4.0/".to_string(),
            start_height: 42,
        }
    }

    #[test]
    fn frame_round_trips_every_command() {
        let tx = Transaction { version: 1, inputs: vec![], outputs: vec![], lock_time: 0 };
        let block = crate::config::ChainParams::default().genesis_block();
        let messages = vec![
            Message::Version(sample_version()),
            Message::Verack,
            Message::Addr(vec![TimestampedAddress {
                last_seen: 7,
                address: NetAddress::from_socket("1.2.3.4:8171".parse().unwrap(), 1),
            }]),
            Message::Inv(vec![InvItem::block([5u8; 32])]),
            Message::GetData(vec![InvItem::tx([6u8; 32])]),
            Message::GetBlocks(GetBlocksMessage {
                version: PROTOCOL_VERSION,
                locator: vec![[1u8; 32], [2u8; 32]],
                hash_stop: [0u8; 32],
            }),
            Message::GetHeaders(GetBlocksMessage {
                version: PROTOCOL_VERSION,
                locator: vec![[3u8; 32]],
                hash_stop: [0u8; 32],
            }),
            Message::Headers(vec![block.header]),
            Message::Tx(tx),
            Message::Block(block),
            Message::Ping(1),
            Message::Pong(2),
        ];
        for message in messages {
            let frame = encode_frame(NETWORK_MAGIC, &message);
            let (decoded, consumed) = decode_frame(&frame, NETWORK_MAGIC).unwrap();
            assert_eq!(consumed, frame.len(), "{}", message.command());
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let frame = encode_frame(NETWORK_MAGIC, &Message::Verack);
        let err = decode_frame(&frame, [0xde, 0xad, 0xbe, 0xef]).unwrap_err();
        assert!(matches!(err, NetError::BadMagic));
    }

    #[test]
    fn corrupted_payload_fails_checksum() {
        let mut frame = encode_frame(NETWORK_MAGIC, &Message::Ping(9));
        let last = frame.len() - 1;
        frame[last] ^= 0xff;
        let err = decode_frame(&frame, NETWORK_MAGIC).unwrap_err();
        assert!(matches!(err, NetError::BadChecksum(_)));
    }

    #[test]
    fn unknown_command_is_rejected() {
        let mut frame = encode_frame(NETWORK_MAGIC, &Message::Verack);
        frame[4..4 + 7].copy_from_slice(b"mystery");
        let err = decode_frame(&frame, NETWORK_MAGIC).unwrap_err();
        assert!(matches!(err, NetError::UnknownCommand(_)));
    }

    #[test]
    fn oversized_declared_payload_is_rejected() {
        let mut frame = encode_frame(NETWORK_MAGIC, &Message::Verack);
        frame[16..20].copy_from_slice(&(MAX_MESSAGE_SIZE as u32 + 1).to_le_bytes());
        let err = decode_frame(&frame, NETWORK_MAGIC).unwrap_err();
        assert!(matches!(err, NetError::OversizedPayload(_)));
    }

    #[test]
    fn routability_rules() {
        let routable = NetAddress::from_socket("8.8.8.8:1".parse().unwrap(), 0);
        assert!(routable.is_routable());
        for private in ["10.0.0.1:1", "172.16.0.1:1", "192.168.1.1:1", "169.254.0.1:1", "127.0.0.1:1"] {
            let addr = NetAddress::from_socket(private.parse().unwrap(), 0);
            assert!(!addr.is_routable(), "{private}");
        }
    }

    #[test]
    fn net_address_socket_round_trip() {
        let socket: SocketAddr = "9.9.9.9:8171".parse().unwrap();
        let addr = NetAddress::from_socket(socket, 1);
        assert_eq!(addr.socket_addr(), socket);
        assert_eq!(addr.key(), "9.9.9.9:8171");
    }
}
