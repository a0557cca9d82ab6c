//! Tagged-text packet protocol.
//!
//! A packet travels as `<Open>payload</Close>` where the delimiter pair is
//! fixed per [`PacketKind`] and the payload is the kind's value in compact
//! text form. The scanner does not understand nesting: a payload must never
//! contain another kind's closing delimiter. Data payloads are base64 encoded
//! inside their format delimiters, so arbitrary bytes cannot collide with a
//! delimiter; free-form text (pure messages, disconnect reasons) can.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::warn;
use weave_storage::PayloadFormat;

use crate::error::{GridError, Result};
use crate::peer::{DisconnectNotice, PeerAnnouncement, PeerGroup};

/// Largest frame, delimiters included, a peer will reassemble.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PacketKind {
    Identity,
    Disconnect,
    PeerGroup,
    DataTransmission,
    PureMessage,
}

impl PacketKind {
    pub const ALL: [PacketKind; 5] = [
        PacketKind::Identity,
        PacketKind::Disconnect,
        PacketKind::PeerGroup,
        PacketKind::DataTransmission,
        PacketKind::PureMessage,
    ];

    pub fn delimiters(self) -> (&'static str, &'static str) {
        match self {
            PacketKind::Identity => ("<Identity>", "</Identity>"),
            PacketKind::Disconnect => ("<Disconnect>", "</Disconnect>"),
            PacketKind::PeerGroup => ("<PeerGroup>", "</PeerGroup>"),
            PacketKind::DataTransmission => ("<DataTransmit>", "</DataTransmit>"),
            PacketKind::PureMessage => ("<Message>", "</Message>"),
        }
    }

    pub fn open(self) -> &'static str {
        self.delimiters().0
    }

    pub fn close(self) -> &'static str {
        self.delimiters().1
    }
}

/// Frame an already serialized payload.
pub fn wrap(kind: PacketKind, payload: &str) -> String {
    let (open, close) = kind.delimiters();
    let mut out = String::with_capacity(open.len() + payload.len() + close.len());
    out.push_str(open);
    out.push_str(payload);
    out.push_str(close);
    out
}

/// One framed message located in a receive buffer.
#[derive(Debug, PartialEq, Eq)]
pub struct Extracted<'a> {
    pub kind: PacketKind,
    pub payload: &'a [u8],
    /// Bytes from the start of the buffer through the closing delimiter.
    pub consumed: usize,
}

/// Locate the first complete framed message in `buffer`.
///
/// The earliest opening delimiter of any kind wins; its closing delimiter is
/// searched only after it. Returns `None` while that frame is incomplete.
pub fn try_extract_one(buffer: &[u8]) -> Option<Extracted<'_>> {
    let (kind, open_at) = PacketKind::ALL
        .iter()
        .filter_map(|k| find(buffer, k.open().as_bytes()).map(|pos| (*k, pos)))
        .min_by_key(|(_, pos)| *pos)?;

    let body_start = open_at + kind.open().len();
    let close = kind.close().as_bytes();
    let body_len = find(&buffer[body_start..], close)?;

    Some(Extracted {
        kind,
        payload: &buffer[body_start..body_start + body_len],
        consumed: body_start + body_len + close.len(),
    })
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Text codec for a packet payload type, keyed by the type itself.
pub trait WireCodec: Sized {
    const KIND: PacketKind;

    fn encode(&self) -> Result<String>;
    fn decode(text: &str) -> Result<Self>;
}

pub fn serialize<T: WireCodec>(value: &T) -> Result<String> {
    value.encode()
}

pub fn deserialize<T: WireCodec>(text: &str) -> Result<T> {
    T::decode(text)
}

macro_rules! json_codec {
    ($ty:ty, $kind:expr) => {
        impl WireCodec for $ty {
            const KIND: PacketKind = $kind;

            fn encode(&self) -> Result<String> {
                Ok(serde_json::to_string(self)?)
            }

            fn decode(text: &str) -> Result<Self> {
                Ok(serde_json::from_str(text)?)
            }
        }
    };
}

json_codec!(PeerAnnouncement, PacketKind::Identity);
json_codec!(DisconnectNotice, PacketKind::Disconnect);
json_codec!(PeerGroup, PacketKind::PeerGroup);
json_codec!(String, PacketKind::PureMessage);

/// Opaque bytes tagged with their declared format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPayload {
    pub format: PayloadFormat,
    pub content: Vec<u8>,
}

impl DataPayload {
    pub fn new(format: PayloadFormat, content: impl Into<Vec<u8>>) -> Self {
        Self {
            format,
            content: content.into(),
        }
    }

    /// Length of this payload once framed for the wire.
    pub fn frame_len(&self) -> usize {
        Self::framed_len(self.format, self.content.len())
    }

    /// Framed length of `len` content bytes in `format`.
    pub fn framed_len(format: PayloadFormat, len: usize) -> usize {
        let (open, close) = PacketKind::DataTransmission.delimiters();
        open.len() + format.open().len() + len.div_ceil(3) * 4 + format.close().len() + close.len()
    }

    /// Fails when the framed payload would exceed [`MAX_MESSAGE_SIZE`].
    pub fn check_size(&self) -> Result<()> {
        let size = self.frame_len();
        if size > MAX_MESSAGE_SIZE {
            return Err(GridError::PayloadTooLarge {
                size,
                limit: MAX_MESSAGE_SIZE,
            });
        }
        Ok(())
    }
}

impl WireCodec for DataPayload {
    const KIND: PacketKind = PacketKind::DataTransmission;

    fn encode(&self) -> Result<String> {
        Ok(self.format.wrap(&BASE64.encode(&self.content)))
    }

    fn decode(text: &str) -> Result<Self> {
        let format = PayloadFormat::detect(text).ok_or_else(|| {
            GridError::Serialization("data payload has no format delimiter".to_string())
        })?;
        let body = text
            .strip_prefix(format.open())
            .and_then(|rest| rest.strip_suffix(format.close()))
            .ok_or_else(|| {
                GridError::Serialization(format!("unterminated {} payload", format))
            })?;
        let content = BASE64
            .decode(body)
            .map_err(|e| GridError::Serialization(e.to_string()))?;
        Ok(Self { format, content })
    }
}

/// Every packet the overlay exchanges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Identity(PeerAnnouncement),
    Disconnect(DisconnectNotice),
    PeerGroup(PeerGroup),
    DataTransmission(DataPayload),
    PureMessage(String),
}

impl Packet {
    pub fn kind(&self) -> PacketKind {
        match self {
            Packet::Identity(_) => PacketKind::Identity,
            Packet::Disconnect(_) => PacketKind::Disconnect,
            Packet::PeerGroup(_) => PacketKind::PeerGroup,
            Packet::DataTransmission(_) => PacketKind::DataTransmission,
            Packet::PureMessage(_) => PacketKind::PureMessage,
        }
    }

    /// Serialize and frame for the wire.
    pub fn to_wire(&self) -> Result<String> {
        let payload = match self {
            Packet::Identity(v) => serialize(v)?,
            Packet::Disconnect(v) => serialize(v)?,
            Packet::PeerGroup(v) => serialize(v)?,
            Packet::DataTransmission(v) => serialize(v)?,
            Packet::PureMessage(v) => serialize(v)?,
        };
        let frame = wrap(self.kind(), &payload);
        if frame.len() > MAX_MESSAGE_SIZE {
            return Err(GridError::PayloadTooLarge {
                size: frame.len(),
                limit: MAX_MESSAGE_SIZE,
            });
        }
        Ok(frame)
    }

    pub fn decode(kind: PacketKind, text: &str) -> Result<Packet> {
        Ok(match kind {
            PacketKind::Identity => Packet::Identity(deserialize(text)?),
            PacketKind::Disconnect => Packet::Disconnect(deserialize(text)?),
            PacketKind::PeerGroup => Packet::PeerGroup(deserialize(text)?),
            PacketKind::DataTransmission => Packet::DataTransmission(deserialize(text)?),
            PacketKind::PureMessage => Packet::PureMessage(deserialize(text)?),
        })
    }

    /// Decode a single datagram or buffer holding one framed packet.
    pub fn from_frame(bytes: &[u8]) -> Result<Packet> {
        let extracted = try_extract_one(bytes)
            .ok_or_else(|| GridError::Protocol("no complete frame".to_string()))?;
        decode_extracted(&extracted)
    }
}

fn decode_extracted(extracted: &Extracted<'_>) -> Result<Packet> {
    let text = std::str::from_utf8(extracted.payload)
        .map_err(|e| GridError::Protocol(format!("payload is not utf-8: {}", e)))?;
    Packet::decode(extracted.kind, text)
}

/// Receive-side accumulator that tolerates partial and coalesced reads.
///
/// Scanning is incremental: bytes already searched are never searched
/// again, so reassembling a frame costs time linear in its size however it
/// is split across reads.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: BytesMut,
    /// Kind of the frame under assembly; its opening delimiter sits at 0.
    open: Option<PacketKind>,
    /// Offset below which the current search has already looked.
    scanned: usize,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pull the next packet out of the buffer.
    ///
    /// `Some(Err(_))` reports a frame that was consumed but could not be
    /// decoded; callers log it and keep reading. `None` means more bytes are
    /// needed.
    pub fn next_packet(&mut self) -> Option<Result<Packet>> {
        let kind = match self.open {
            Some(kind) => kind,
            None => {
                let kind = self.find_open()?;
                self.open = Some(kind);
                self.scanned = kind.open().len();
                kind
            }
        };

        let body_start = kind.open().len();
        let close = kind.close().as_bytes();
        let from = self.scanned.saturating_sub(close.len() - 1).max(body_start);
        let Some(at) = find(&self.buf[from..], close) else {
            self.scanned = self.buf.len();
            if self.buf.len() > MAX_MESSAGE_SIZE {
                warn!(
                    "Dropping {} byte {:?} frame over the {} byte limit",
                    self.buf.len(),
                    kind,
                    MAX_MESSAGE_SIZE
                );
                self.reset();
            }
            return None;
        };

        let body_end = from + at;
        let result = decode_extracted(&Extracted {
            kind,
            payload: &self.buf[body_start..body_end],
            consumed: body_end + close.len(),
        });
        self.buf.advance(body_end + close.len());
        self.open = None;
        self.scanned = 0;
        Some(result)
    }

    /// Advance to the earliest opening delimiter. Every delimiter starts
    /// with `<`, so anything that cannot begin one is dropped. A `<` that
    /// may still grow into a delimiter is kept and the search waits there.
    fn find_open(&mut self) -> Option<PacketKind> {
        let mut at = self.scanned;
        while let Some(rel) = self.buf[at..].iter().position(|b| *b == b'<') {
            let pos = at + rel;
            let rest = &self.buf[pos..];
            if let Some(kind) = PacketKind::ALL
                .into_iter()
                .find(|k| rest.starts_with(k.open().as_bytes()))
            {
                self.buf.advance(pos);
                return Some(kind);
            }
            if PacketKind::ALL
                .iter()
                .any(|k| k.open().as_bytes().starts_with(rest))
            {
                self.buf.advance(pos);
                self.scanned = 0;
                return None;
            }
            at = pos + 1;
        }
        self.reset();
        None
    }

    fn reset(&mut self) {
        self.buf.clear();
        self.open = None;
        self.scanned = 0;
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Read until one packet is complete. Bytes past it stay in `frames`.
pub async fn read_packet<R>(reader: &mut R, frames: &mut FrameBuffer) -> Result<Packet>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 4096];
    loop {
        if let Some(result) = frames.next_packet() {
            return result;
        }
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(GridError::ConnectionFailed(
                "connection closed before a complete packet".to_string(),
            ));
        }
        frames.extend(&chunk[..n]);
    }
}

pub async fn write_packet<W>(writer: &mut W, packet: &Packet) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = packet.to_wire()?;
    writer.write_all(frame.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}
