//! snapmesh wire format — on-wire types for all mesh communication.
//!
//! Every message on a peer link travels inside a length-prefixed frame:
//! a 4-byte big-endian length, then a 1-byte packet type, then the body.
//! Piece-protocol messages use fixed big-endian layouts expressed as
//! zerocopy structs; the snap message uses a tag-length-value scheme so
//! string fields can vary and old readers can reject unknown tags loudly.
//!
//! Decoding is pure and total: a buffer either yields a fully-valid
//! `Packet` or a `WireError`. No partial decode is ever exposed and no
//! input can cause an out-of-bounds access.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{BigEndian, U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::chunker::ChunkManifest;
use crate::snap::{ContentId, Snap, MAX_ALIAS_LEN};

/// Maximum frame payload in bytes. Any declared length of zero or above
/// this is rejected before the body is read.
pub const MAX_FRAME: usize = 1_000_000;

/// Packet type tags, the first byte of every frame payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// A whole snap, TLV-encoded.
    Snap = 0x01,
    /// Request for one piece of chunked content.
    PieceRequest = 0x02,
    /// One verified-at-source piece of chunked content.
    PieceResponse = 0x03,
    /// Bitfield announcement of which pieces a peer holds.
    PieceHave = 0x04,
    /// Chunk manifest for a receiver that has only the content id.
    ChunkManifest = 0x05,
}

impl TryFrom<u8> for PacketType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(PacketType::Snap),
            0x02 => Ok(PacketType::PieceRequest),
            0x03 => Ok(PacketType::PieceResponse),
            0x04 => Ok(PacketType::PieceHave),
            0x05 => Ok(PacketType::ChunkManifest),
            other => Err(WireError::UnknownPacketType(other)),
        }
    }
}

// ── Fixed layouts ────────────────────────────────────────────────────────────

/// Piece request body. Wire size: 36 bytes exactly.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct PieceRequestWire {
    pub content_id: [u8; 32],
    pub piece_index: U32<BigEndian>,
}

assert_eq_size!(PieceRequestWire, [u8; 36]);

/// Piece response header, followed by `piece_len` data bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct PieceResponseHeader {
    pub content_id: [u8; 32],
    pub piece_index: U32<BigEndian>,
    pub piece_len: U32<BigEndian>,
}

assert_eq_size!(PieceResponseHeader, [u8; 40]);

/// Piece-have header, followed by `bitfield_len` bitfield bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct PieceHaveHeader {
    pub content_id: [u8; 32],
    pub piece_count: U32<BigEndian>,
    pub bitfield_len: U32<BigEndian>,
}

assert_eq_size!(PieceHaveHeader, [u8; 40]);

/// Chunk manifest header, followed by `piece_count` 32-byte piece hashes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct ChunkManifestHeader {
    pub piece_size: U32<BigEndian>,
    pub total_size: U64<BigEndian>,
    pub piece_count: U32<BigEndian>,
    pub merkle_root: [u8; 32],
}

assert_eq_size!(ChunkManifestHeader, [u8; 48]);

// ── Snap TLV tags ────────────────────────────────────────────────────────────

/// TLV tags for the snap message. All fields are required. Every tag uses
/// a 2-byte length except `CONTENT`, which uses 4 bytes so payloads can
/// exceed 64 KiB.
pub mod tag {
    pub const ID: u8 = 1;
    pub const SENDER: u8 = 2;
    pub const ALIAS: u8 = 3;
    pub const MIME: u8 = 4;
    pub const CONTENT: u8 = 5;
    pub const CREATED_AT: u8 = 6;
    pub const EXPIRES_AT: u8 = 7;
    pub const SIGNATURE: u8 = 8;
}

// ── Errors ───────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("empty frame")]
    Empty,

    #[error("unknown packet type: 0x{0:02x}")]
    UnknownPacketType(u8),

    #[error("{what}: expected {expected} bytes, got {got}")]
    WrongSize {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("truncated {what}: need {need} bytes, have {have}")]
    Truncated {
        what: &'static str,
        need: usize,
        have: usize,
    },

    #[error("declared length {0} exceeds maximum {MAX_FRAME}")]
    Oversize(usize),

    #[error("unknown TLV tag: {0}")]
    UnknownTag(u8),

    #[error("duplicate TLV tag: {0}")]
    DuplicateTag(u8),

    #[error("missing TLV tag: {0}")]
    MissingTag(u8),

    #[error("tag {tag}: length {len}, expected {expected}")]
    BadFieldLength { tag: u8, len: usize, expected: usize },

    #[error("alias is {0} bytes, limit {MAX_ALIAS_LEN}")]
    AliasTooLong(usize),

    #[error("tag {0}: invalid UTF-8")]
    BadUtf8(u8),
}

// ── Packet ───────────────────────────────────────────────────────────────────

/// A decoded wire message.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Snap(Snap),
    PieceRequest {
        content_id: ContentId,
        piece_index: u32,
    },
    PieceResponse {
        content_id: ContentId,
        piece_index: u32,
        data: Bytes,
    },
    PieceHave {
        content_id: ContentId,
        piece_count: u32,
        bitfield: Bytes,
    },
    ChunkManifest(ChunkManifest),
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Snap(_) => PacketType::Snap,
            Packet::PieceRequest { .. } => PacketType::PieceRequest,
            Packet::PieceResponse { .. } => PacketType::PieceResponse,
            Packet::PieceHave { .. } => PacketType::PieceHave,
            Packet::ChunkManifest(_) => PacketType::ChunkManifest,
        }
    }

    /// Encode into a frame payload: type byte + body.
    pub fn encode(&self) -> Result<Bytes, WireError> {
        let mut buf = BytesMut::new();
        buf.put_u8(self.packet_type() as u8);

        match self {
            Packet::Snap(snap) => encode_snap_body(snap, &mut buf)?,

            Packet::PieceRequest {
                content_id,
                piece_index,
            } => {
                let wire = PieceRequestWire {
                    content_id: *content_id,
                    piece_index: U32::new(*piece_index),
                };
                buf.put_slice(wire.as_bytes());
            }

            Packet::PieceResponse {
                content_id,
                piece_index,
                data,
            } => {
                if data.len() > MAX_FRAME {
                    return Err(WireError::Oversize(data.len()));
                }
                let header = PieceResponseHeader {
                    content_id: *content_id,
                    piece_index: U32::new(*piece_index),
                    piece_len: U32::new(data.len() as u32),
                };
                buf.put_slice(header.as_bytes());
                buf.put_slice(data);
            }

            Packet::PieceHave {
                content_id,
                piece_count,
                bitfield,
            } => {
                let header = PieceHaveHeader {
                    content_id: *content_id,
                    piece_count: U32::new(*piece_count),
                    bitfield_len: U32::new(bitfield.len() as u32),
                };
                buf.put_slice(header.as_bytes());
                buf.put_slice(bitfield);
            }

            Packet::ChunkManifest(manifest) => {
                let header = ChunkManifestHeader {
                    piece_size: U32::new(manifest.piece_size),
                    total_size: U64::new(manifest.total_size),
                    piece_count: U32::new(manifest.piece_count()),
                    merkle_root: manifest.merkle_root,
                };
                buf.put_slice(header.as_bytes());
                for hash in &manifest.piece_hashes {
                    buf.put_slice(hash);
                }
            }
        }

        if buf.len() > MAX_FRAME {
            return Err(WireError::Oversize(buf.len()));
        }
        Ok(buf.freeze())
    }

    /// Decode a frame payload. Either a fully-valid packet or an error.
    pub fn decode(frame: &[u8]) -> Result<Packet, WireError> {
        if frame.is_empty() {
            return Err(WireError::Empty);
        }
        if frame.len() > MAX_FRAME {
            return Err(WireError::Oversize(frame.len()));
        }

        let ptype = PacketType::try_from(frame[0])?;
        let body = &frame[1..];

        match ptype {
            PacketType::Snap => Ok(Packet::Snap(decode_snap_body(body)?)),

            PacketType::PieceRequest => {
                let wire =
                    PieceRequestWire::read_from(body).ok_or(WireError::WrongSize {
                        what: "piece request",
                        expected: std::mem::size_of::<PieceRequestWire>(),
                        got: body.len(),
                    })?;
                Ok(Packet::PieceRequest {
                    content_id: wire.content_id,
                    piece_index: wire.piece_index.get(),
                })
            }

            PacketType::PieceResponse => {
                const HDR: usize = std::mem::size_of::<PieceResponseHeader>();
                let header =
                    PieceResponseHeader::read_from_prefix(body).ok_or(WireError::Truncated {
                        what: "piece response header",
                        need: HDR,
                        have: body.len(),
                    })?;
                let piece_len = header.piece_len.get() as usize;
                if piece_len > MAX_FRAME {
                    return Err(WireError::Oversize(piece_len));
                }
                let data = &body[HDR..];
                if data.len() != piece_len {
                    return Err(WireError::WrongSize {
                        what: "piece data",
                        expected: piece_len,
                        got: data.len(),
                    });
                }
                Ok(Packet::PieceResponse {
                    content_id: header.content_id,
                    piece_index: header.piece_index.get(),
                    data: Bytes::copy_from_slice(data),
                })
            }

            PacketType::PieceHave => {
                const HDR: usize = std::mem::size_of::<PieceHaveHeader>();
                let header =
                    PieceHaveHeader::read_from_prefix(body).ok_or(WireError::Truncated {
                        what: "piece-have header",
                        need: HDR,
                        have: body.len(),
                    })?;
                let piece_count = header.piece_count.get();
                let declared = header.bitfield_len.get() as usize;
                let expected = (piece_count as usize).div_ceil(8);
                if declared != expected {
                    return Err(WireError::WrongSize {
                        what: "bitfield",
                        expected,
                        got: declared,
                    });
                }
                let bits = &body[HDR..];
                if bits.len() != declared {
                    return Err(WireError::WrongSize {
                        what: "bitfield bytes",
                        expected: declared,
                        got: bits.len(),
                    });
                }
                Ok(Packet::PieceHave {
                    content_id: header.content_id,
                    piece_count,
                    bitfield: Bytes::copy_from_slice(bits),
                })
            }

            PacketType::ChunkManifest => {
                const HDR: usize = std::mem::size_of::<ChunkManifestHeader>();
                let header =
                    ChunkManifestHeader::read_from_prefix(body).ok_or(WireError::Truncated {
                        what: "manifest header",
                        need: HDR,
                        have: body.len(),
                    })?;
                let piece_count = header.piece_count.get() as usize;
                if piece_count > MAX_FRAME / 32 {
                    return Err(WireError::Oversize(piece_count * 32));
                }
                let hashes = &body[HDR..];
                if hashes.len() != piece_count * 32 {
                    return Err(WireError::WrongSize {
                        what: "piece hash list",
                        expected: piece_count * 32,
                        got: hashes.len(),
                    });
                }
                let piece_hashes = hashes
                    .chunks_exact(32)
                    .map(|chunk| {
                        let mut hash = [0u8; 32];
                        hash.copy_from_slice(chunk);
                        hash
                    })
                    .collect();
                Ok(Packet::ChunkManifest(ChunkManifest {
                    merkle_root: header.merkle_root,
                    piece_size: header.piece_size.get(),
                    total_size: header.total_size.get(),
                    piece_hashes,
                }))
            }
        }
    }
}

// ── Snap TLV codec ───────────────────────────────────────────────────────────

fn put_tlv2(buf: &mut BytesMut, tag: u8, value: &[u8]) {
    buf.put_u8(tag);
    buf.put_u16(value.len() as u16);
    buf.put_slice(value);
}

/// Encode the snap TLV body. Also the durable on-disk representation.
pub fn encode_snap_body(snap: &Snap, buf: &mut BytesMut) -> Result<(), WireError> {
    if snap.alias.len() > MAX_ALIAS_LEN {
        return Err(WireError::AliasTooLong(snap.alias.len()));
    }
    if snap.content.len() > MAX_FRAME {
        return Err(WireError::Oversize(snap.content.len()));
    }

    put_tlv2(buf, tag::ID, &snap.id);
    put_tlv2(buf, tag::SENDER, &snap.sender);
    put_tlv2(buf, tag::ALIAS, snap.alias.as_bytes());
    put_tlv2(buf, tag::MIME, snap.mime.as_bytes());

    // Content alone carries a 4-byte length.
    buf.put_u8(tag::CONTENT);
    buf.put_u32(snap.content.len() as u32);
    buf.put_slice(&snap.content);

    put_tlv2(buf, tag::CREATED_AT, &snap.created_at.to_be_bytes());
    put_tlv2(buf, tag::EXPIRES_AT, &snap.expires_at.to_be_bytes());
    put_tlv2(buf, tag::SIGNATURE, &snap.signature);
    Ok(())
}

/// Encode a snap TLV body into a fresh buffer.
pub fn snap_to_bytes(snap: &Snap) -> Result<Bytes, WireError> {
    let mut buf = BytesMut::new();
    encode_snap_body(snap, &mut buf)?;
    Ok(buf.freeze())
}

fn fixed<const N: usize>(tag: u8, value: &[u8]) -> Result<[u8; N], WireError> {
    value.try_into().map_err(|_| WireError::BadFieldLength {
        tag,
        len: value.len(),
        expected: N,
    })
}

fn utf8(tag: u8, value: Vec<u8>) -> Result<String, WireError> {
    String::from_utf8(value).map_err(|_| WireError::BadUtf8(tag))
}

/// Decode a snap TLV body. All eight tags are required; unknown or
/// duplicate tags and out-of-bounds lengths are rejected outright.
pub fn decode_snap_body(mut input: &[u8]) -> Result<Snap, WireError> {
    let mut id = None;
    let mut sender = None;
    let mut alias = None;
    let mut mime = None;
    let mut content = None;
    let mut created_at = None;
    let mut expires_at = None;
    let mut signature = None;

    while input.has_remaining() {
        let tag = input.get_u8();

        let len_width = match tag {
            tag::CONTENT => 4,
            tag::ID
            | tag::SENDER
            | tag::ALIAS
            | tag::MIME
            | tag::CREATED_AT
            | tag::EXPIRES_AT
            | tag::SIGNATURE => 2,
            other => return Err(WireError::UnknownTag(other)),
        };
        if input.remaining() < len_width {
            return Err(WireError::Truncated {
                what: "TLV length",
                need: len_width,
                have: input.remaining(),
            });
        }
        let len = if len_width == 4 {
            input.get_u32() as usize
        } else {
            input.get_u16() as usize
        };
        if len > MAX_FRAME {
            return Err(WireError::Oversize(len));
        }
        if input.remaining() < len {
            return Err(WireError::Truncated {
                what: "TLV value",
                need: len,
                have: input.remaining(),
            });
        }
        let mut value = vec![0u8; len];
        input.copy_to_slice(&mut value);

        let slot_taken = match tag {
            tag::ID => id.replace(fixed::<32>(tag, &value)?).is_some(),
            tag::SENDER => sender.replace(fixed::<32>(tag, &value)?).is_some(),
            tag::ALIAS => {
                if value.len() > MAX_ALIAS_LEN {
                    return Err(WireError::AliasTooLong(value.len()));
                }
                alias.replace(utf8(tag, value)?).is_some()
            }
            tag::MIME => mime.replace(utf8(tag, value)?).is_some(),
            tag::CONTENT => content.replace(Bytes::from(value)).is_some(),
            tag::CREATED_AT => created_at
                .replace(u64::from_be_bytes(fixed::<8>(tag, &value)?))
                .is_some(),
            tag::EXPIRES_AT => expires_at
                .replace(u64::from_be_bytes(fixed::<8>(tag, &value)?))
                .is_some(),
            tag::SIGNATURE => signature.replace(fixed::<64>(tag, &value)?).is_some(),
            _ => unreachable!("tag validated above"),
        };
        if slot_taken {
            return Err(WireError::DuplicateTag(tag));
        }
    }

    Ok(Snap {
        id: id.ok_or(WireError::MissingTag(tag::ID))?,
        sender: sender.ok_or(WireError::MissingTag(tag::SENDER))?,
        alias: alias.ok_or(WireError::MissingTag(tag::ALIAS))?,
        mime: mime.ok_or(WireError::MissingTag(tag::MIME))?,
        content: content.ok_or(WireError::MissingTag(tag::CONTENT))?,
        created_at: created_at.ok_or(WireError::MissingTag(tag::CREATED_AT))?,
        expires_at: expires_at.ok_or(WireError::MissingTag(tag::EXPIRES_AT))?,
        signature: signature.ok_or(WireError::MissingTag(tag::SIGNATURE))?,
    })
}

// ── Tests ────────────────────────────────────────────────────────────────────
