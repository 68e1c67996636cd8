//! Typed packets and the `(direction, phase, id)` registry.
//!
//! Only the packets the gateway needs to understand are registered; every
//! other id is carried as [`PacketBody::Opaque`] and re-emitted byte for
//! byte. Re-encoding reuses the original bytes unless the caller marks the
//! packet as modified, so an untouched packet survives the splice verbatim.

use std::io::{Cursor, Read, Seek, Write};

use binrw::{BinRead, BinResult, BinWrite, Endian};

use crate::codec::{self, MAX_FRAME_LEN, MAX_STRING_LEN, MAX_VARINT_BYTES};
use crate::error::{ProtoError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Client to server.
    Serverbound,
    /// Server to client.
    Clientbound,
}

impl Direction {
    pub fn tag(self) -> char {
        match self {
            Direction::Serverbound => 'C',
            Direction::Clientbound => 'S',
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Idle,
    Status,
    Login,
    Play,
}

impl Phase {
    pub fn tag(self) -> char {
        match self {
            Phase::Idle => 'I',
            Phase::Status => 'S',
            Phase::Login => 'L',
            Phase::Play => 'P',
        }
    }

    /// Maps the handshake's `next_state` field onto a phase.
    pub fn from_next_state(value: i32) -> Option<Phase> {
        match value {
            1 => Some(Phase::Status),
            2 => Some(Phase::Login),
            _ => None,
        }
    }
}

/// Protocol 47 packet ids for the registered packets.
pub struct PacketId;

impl PacketId {
    pub const HANDSHAKE: i32 = 0x00;

    pub const STATUS_REQUEST: i32 = 0x00;
    pub const STATUS_RESPONSE: i32 = 0x00;
    pub const STATUS_PING: i32 = 0x01;
    pub const STATUS_PONG: i32 = 0x01;

    pub const LOGIN_START: i32 = 0x00;
    pub const LOGIN_DISCONNECT: i32 = 0x00;
    pub const ENCRYPTION_REQUEST: i32 = 0x01;
    pub const ENCRYPTION_RESPONSE: i32 = 0x01;
    pub const LOGIN_SUCCESS: i32 = 0x02;
    pub const SET_COMPRESSION: i32 = 0x03;

    pub const KEEP_ALIVE: i32 = 0x00;
    pub const CHAT_SERVERBOUND: i32 = 0x01;
    pub const CHAT_CLIENTBOUND: i32 = 0x02;
}

/// A protocol varint as a binrw field type.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VarInt(pub i32);

impl BinRead for VarInt {
    type Args<'a> = ();

    fn read_options<R: Read + Seek>(
        reader: &mut R,
        endian: Endian,
        args: Self::Args<'_>,
    ) -> BinResult<Self> {
        let mut value: u32 = 0;
        for shift in 0..MAX_VARINT_BYTES {
            let byte = <u8>::read_options(reader, endian, args)?;
            value |= u32::from(byte & 0x7f) << (7 * shift);
            if byte & 0x80 == 0 {
                return Ok(Self(value as i32));
            }
        }
        Err(binrw::Error::AssertFail {
            pos: reader.stream_position()?,
            message: "varint exceeds 5 bytes".to_string(),
        })
    }
}

impl BinWrite for VarInt {
    type Args<'a> = ();

    fn write_options<W: Write + Seek>(
        &self,
        writer: &mut W,
        _: Endian,
        _: Self::Args<'_>,
    ) -> BinResult<()> {
        let mut v = self.0 as u32;
        loop {
            if v & !0x7f == 0 {
                writer.write_all(&[v as u8])?;
                return Ok(());
            }
            writer.write_all(&[(v as u8 & 0x7f) | 0x80])?;
            v >>= 7;
        }
    }
}

/// A varint-length-prefixed UTF-8 string.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct McString(pub String);

impl From<&str> for McString {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl BinRead for McString {
    type Args<'a> = ();

    fn read_options<R: Read + Seek>(
        reader: &mut R,
        endian: Endian,
        args: Self::Args<'_>,
    ) -> BinResult<Self> {
        let len = VarInt::read_options(reader, endian, args)?.0;
        if len < 0 || len as usize > MAX_STRING_LEN {
            return Err(binrw::Error::AssertFail {
                pos: reader.stream_position()?,
                message: format!("string length {len} out of range"),
            });
        }
        let mut buf = vec![0u8; len as usize];
        reader.read_exact(&mut buf)?;
        match String::from_utf8(buf) {
            Ok(value) => Ok(Self(value)),
            Err(_) => Err(binrw::Error::AssertFail {
                pos: reader.stream_position()?,
                message: "string is not UTF-8".to_string(),
            }),
        }
    }
}

impl BinWrite for McString {
    type Args<'a> = ();

    fn write_options<W: Write + Seek>(
        &self,
        writer: &mut W,
        endian: Endian,
        args: Self::Args<'_>,
    ) -> BinResult<()> {
        VarInt(self.0.len() as i32).write_options(writer, endian, args)?;
        writer.write_all(self.0.as_bytes())?;
        Ok(())
    }
}

/// A varint-length-prefixed byte array (keys, wrapped secrets, tokens).
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct VarBytes(pub Vec<u8>);

impl BinRead for VarBytes {
    type Args<'a> = ();

    fn read_options<R: Read + Seek>(
        reader: &mut R,
        endian: Endian,
        args: Self::Args<'_>,
    ) -> BinResult<Self> {
        let len = VarInt::read_options(reader, endian, args)?.0;
        if len < 0 || len as usize > MAX_FRAME_LEN {
            return Err(binrw::Error::AssertFail {
                pos: reader.stream_position()?,
                message: format!("byte array length {len} out of range"),
            });
        }
        let mut buf = vec![0u8; len as usize];
        reader.read_exact(&mut buf)?;
        Ok(Self(buf))
    }
}

impl BinWrite for VarBytes {
    type Args<'a> = ();

    fn write_options<W: Write + Seek>(
        &self,
        writer: &mut W,
        endian: Endian,
        args: Self::Args<'_>,
    ) -> BinResult<()> {
        VarInt(self.0.len() as i32).write_options(writer, endian, args)?;
        writer.write_all(&self.0)?;
        Ok(())
    }
}

#[derive(BinRead, BinWrite, Debug, Clone, PartialEq)]
#[br(big)]
#[bw(big)]
pub struct Handshake {
    pub protocol_version: VarInt,
    pub server_address: McString,
    pub server_port: u16,
    pub next_state: VarInt,
}

#[derive(BinRead, BinWrite, Debug, Clone, PartialEq)]
#[br(big)]
#[bw(big)]
pub struct StatusResponse {
    pub status: McString,
}

#[derive(BinRead, BinWrite, Debug, Clone, PartialEq)]
#[br(big)]
#[bw(big)]
pub struct StatusPing {
    pub payload: i64,
}

#[derive(BinRead, BinWrite, Debug, Clone, PartialEq)]
#[br(big)]
#[bw(big)]
pub struct StatusPong {
    pub payload: i64,
}

#[derive(BinRead, BinWrite, Debug, Clone, PartialEq)]
#[br(big)]
#[bw(big)]
pub struct LoginStart {
    pub name: McString,
}

#[derive(BinRead, BinWrite, Debug, Clone, PartialEq)]
#[br(big)]
#[bw(big)]
pub struct LoginDisconnect {
    pub reason: McString,
}

#[derive(BinRead, BinWrite, Debug, Clone, PartialEq)]
#[br(big)]
#[bw(big)]
pub struct EncryptionRequest {
    pub server_id: McString,
    pub public_key: VarBytes,
    pub verify_token: VarBytes,
}

#[derive(BinRead, BinWrite, Debug, Clone, PartialEq)]
#[br(big)]
#[bw(big)]
pub struct EncryptionResponse {
    pub shared_secret: VarBytes,
    pub verify_token: VarBytes,
}

#[derive(BinRead, BinWrite, Debug, Clone, PartialEq)]
#[br(big)]
#[bw(big)]
pub struct LoginSuccess {
    pub uuid: McString,
    pub username: McString,
}

#[derive(BinRead, BinWrite, Debug, Clone, PartialEq)]
#[br(big)]
#[bw(big)]
pub struct SetCompression {
    pub threshold: VarInt,
}

#[derive(BinRead, BinWrite, Debug, Clone, PartialEq)]
#[br(big)]
#[bw(big)]
pub struct KeepAlive {
    pub keep_alive_id: VarInt,
}

#[derive(BinRead, BinWrite, Debug, Clone, PartialEq)]
#[br(big)]
#[bw(big)]
pub struct ChatRequest {
    pub message: McString,
}

#[derive(BinRead, BinWrite, Debug, Clone, PartialEq)]
#[br(big)]
#[bw(big)]
pub struct ChatMessage {
    pub json: McString,
    pub position: i8,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PacketBody {
    Handshake(Handshake),
    StatusRequest,
    StatusResponse(StatusResponse),
    StatusPing(StatusPing),
    StatusPong(StatusPong),
    LoginStart(LoginStart),
    LoginDisconnect(LoginDisconnect),
    EncryptionRequest(EncryptionRequest),
    EncryptionResponse(EncryptionResponse),
    LoginSuccess(LoginSuccess),
    SetCompression(SetCompression),
    KeepAlive(KeepAlive),
    ChatRequest(ChatRequest),
    ChatMessage(ChatMessage),
    /// Unregistered id; only the raw bytes are carried.
    Opaque,
}

/// One decoded frame payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub direction: Direction,
    pub phase: Phase,
    pub id: i32,
    pub body: PacketBody,
    /// Body bytes after the id varint, exactly as received.
    pub raw: Vec<u8>,
    /// When unset, `encode` re-emits `raw` verbatim.
    pub modified: bool,
}

fn read_body<T>(bytes: &[u8]) -> Result<T>
where
    for<'a> T: BinRead<Args<'a> = ()>,
{
    let mut cursor = Cursor::new(bytes);
    T::read_options(&mut cursor, Endian::Big, ())
        .map_err(|err| ProtoError::Framing(format!("packet body: {err}")))
}

fn write_body<T>(value: &T, out: &mut Vec<u8>) -> Result<()>
where
    for<'a> T: BinWrite<Args<'a> = ()>,
{
    let mut cursor = Cursor::new(Vec::new());
    value
        .write_options(&mut cursor, Endian::Big, ())
        .map_err(|err| ProtoError::Framing(format!("packet body: {err}")))?;
    out.extend_from_slice(&cursor.into_inner());
    Ok(())
}

type DecodeFn = fn(&[u8]) -> Result<PacketBody>;

/// The compile-time registry. Unlisted combinations decode as `Opaque`.
pub fn decoder_for(direction: Direction, phase: Phase, id: i32) -> Option<DecodeFn> {
    use Direction::{Clientbound, Serverbound};
    use Phase::{Idle, Login, Play, Status};

    let decode: DecodeFn = match (direction, phase, id) {
        (Serverbound, Idle, PacketId::HANDSHAKE) => {
            |b| Ok(PacketBody::Handshake(read_body(b)?))
        }
        (Serverbound, Status, PacketId::STATUS_REQUEST) => |_| Ok(PacketBody::StatusRequest),
        (Serverbound, Status, PacketId::STATUS_PING) => {
            |b| Ok(PacketBody::StatusPing(read_body(b)?))
        }
        (Clientbound, Status, PacketId::STATUS_RESPONSE) => {
            |b| Ok(PacketBody::StatusResponse(read_body(b)?))
        }
        (Clientbound, Status, PacketId::STATUS_PONG) => {
            |b| Ok(PacketBody::StatusPong(read_body(b)?))
        }
        (Serverbound, Login, PacketId::LOGIN_START) => {
            |b| Ok(PacketBody::LoginStart(read_body(b)?))
        }
        (Serverbound, Login, PacketId::ENCRYPTION_RESPONSE) => {
            |b| Ok(PacketBody::EncryptionResponse(read_body(b)?))
        }
        (Clientbound, Login, PacketId::LOGIN_DISCONNECT) => {
            |b| Ok(PacketBody::LoginDisconnect(read_body(b)?))
        }
        (Clientbound, Login, PacketId::ENCRYPTION_REQUEST) => {
            |b| Ok(PacketBody::EncryptionRequest(read_body(b)?))
        }
        (Clientbound, Login, PacketId::LOGIN_SUCCESS) => {
            |b| Ok(PacketBody::LoginSuccess(read_body(b)?))
        }
        (Clientbound, Login, PacketId::SET_COMPRESSION) => {
            |b| Ok(PacketBody::SetCompression(read_body(b)?))
        }
        (Serverbound, Play, PacketId::KEEP_ALIVE) | (Clientbound, Play, PacketId::KEEP_ALIVE) => {
            |b| Ok(PacketBody::KeepAlive(read_body(b)?))
        }
        (Serverbound, Play, PacketId::CHAT_SERVERBOUND) => {
            |b| Ok(PacketBody::ChatRequest(read_body(b)?))
        }
        (Clientbound, Play, PacketId::CHAT_CLIENTBOUND) => {
            |b| Ok(PacketBody::ChatMessage(read_body(b)?))
        }
        _ => return None,
    };
    Some(decode)
}

impl Packet {
    /// Decodes a frame payload (id varint plus body, envelope stripped).
    pub fn decode(direction: Direction, phase: Phase, payload: &[u8]) -> Result<Packet> {
        let mut cursor = Cursor::new(payload);
        let id = codec::read_varint(&mut cursor)?;
        let raw = payload[cursor.position() as usize..].to_vec();
        let body = match decoder_for(direction, phase, id) {
            Some(decode) => decode(&raw)?,
            None => PacketBody::Opaque,
        };
        Ok(Packet {
            direction,
            phase,
            id,
            body,
            raw,
            modified: false,
        })
    }

    /// Builds a packet with no wire origin, e.g. for injection.
    pub fn synthetic(direction: Direction, phase: Phase, id: i32, body: PacketBody) -> Packet {
        Packet {
            direction,
            phase,
            id,
            body,
            raw: Vec::new(),
            modified: true,
        }
    }

    /// Appends the packet payload (id varint plus body) to `out`. Unmodified
    /// packets re-emit their original bytes for splice fidelity.
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<()> {
        codec::write_varint(out, self.id);
        if !self.modified {
            out.extend_from_slice(&self.raw);
            return Ok(());
        }
        match &self.body {
            PacketBody::Handshake(p) => write_body(p, out),
            PacketBody::StatusRequest => Ok(()),
            PacketBody::StatusResponse(p) => write_body(p, out),
            PacketBody::StatusPing(p) => write_body(p, out),
            PacketBody::StatusPong(p) => write_body(p, out),
            PacketBody::LoginStart(p) => write_body(p, out),
            PacketBody::LoginDisconnect(p) => write_body(p, out),
            PacketBody::EncryptionRequest(p) => write_body(p, out),
            PacketBody::EncryptionResponse(p) => write_body(p, out),
            PacketBody::LoginSuccess(p) => write_body(p, out),
            PacketBody::SetCompression(p) => write_body(p, out),
            PacketBody::KeepAlive(p) => write_body(p, out),
            PacketBody::ChatRequest(p) => write_body(p, out),
            PacketBody::ChatMessage(p) => write_body(p, out),
            PacketBody::Opaque => {
                out.extend_from_slice(&self.raw);
                Ok(())
            }
        }
    }

    /// One-line diagnostic rendering.
    pub fn dump(&self) -> String {
        let head = format!(
            "{} {} {:02x} ",
            self.direction.tag(),
            self.phase.tag(),
            self.id
        );
        match &self.body {
            PacketBody::Opaque => format!("{head}{}", limhex(&self.raw, 64)),
            body => format!("{head}{body:?}"),
        }
    }
}

fn limhex(data: &[u8], max: usize) -> String {
    let shown = data.len().min(max);
    let mut out = String::with_capacity(shown * 3 + 3);
    for byte in &data[..shown] {
        out.push_str(&format!("{byte:02x} "));
    }
    if data.len() > max {
        out.push_str("..");
    }
    out
}
