//! Binary wire protocol shared with streaming clients.
//!
//! Egress framing is a fixed [`NetPacketHeader`] (version, type, big-endian
//! length) immediately followed by the body. The format is self-delimiting
//! with no alignment; readers must never assume message boundaries coincide
//! with transport reads.
//!
//! Ingress framing is a 4-byte big-endian `size` prefix ([`PACKAGE_HEAD_LEN`])
//! followed by a one-byte action and an action-specific body.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::ProtocolError;

/// Current egress packet header version.
pub const NET_PACKET_VERSION: u8 = 0;

/// Client/server protocol revision carried in login and login-result bodies.
pub const PROTOCOL_VERSION: u64 = 1;

/// Length of the ingress size prefix.
pub const PACKAGE_HEAD_LEN: usize = 4;

/// Fixed-size username field in the login body, NUL-padded.
pub const USERNAME_LEN: usize = 32;

/// Upper bound on the opaque verification blob in a login body.
pub const VERIFICATION_DATA_MAX: usize = 64;

/// Egress packet type.
///
/// Values 0-3 are the media/keepalive range. `LoginResult` is a session
/// control packet outside that range, sent once on successful authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketKind {
    Audio = 0,
    Video = 1,
    Ping = 2,
    Pong = 3,
    LoginResult = 16,
}

impl PacketKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Audio),
            1 => Some(Self::Video),
            2 => Some(Self::Ping),
            3 => Some(Self::Pong),
            16 => Some(Self::LoginResult),
            _ => None,
        }
    }

    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Egress packet header: `{ version: u8, type: u8, size: u32 BE }`.
///
/// `size` is exactly the number of body bytes that follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetPacketHeader {
    pub version: u8,
    pub kind: PacketKind,
    pub size: u32,
}

impl NetPacketHeader {
    pub const LEN: usize = 6;

    pub fn new(kind: PacketKind, size: u32) -> Self {
        Self {
            version: NET_PACKET_VERSION,
            kind,
            size,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.version);
        buf.put_u8(self.kind.as_u8());
        buf.put_u32(self.size);
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < Self::LEN {
            return Err(ProtocolError::Truncated);
        }
        let version = buf.get_u8();
        if version != NET_PACKET_VERSION {
            return Err(ProtocolError::BadVersion(version));
        }
        let raw_kind = buf.get_u8();
        let kind = PacketKind::from_u8(raw_kind).ok_or(ProtocolError::UnknownType(raw_kind))?;
        let size = buf.get_u32();
        Ok(Self {
            version,
            kind,
            size,
        })
    }

    /// Rewrites the size field of an already-encoded header in place.
    pub fn patch_size(encoded: &mut [u8], size: u32) {
        debug_assert!(encoded.len() >= Self::LEN);
        encoded[2..6].copy_from_slice(&size.to_be_bytes());
    }
}

/// Ingress action discriminator, first byte after the size prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClientAction {
    Login = 0,
    Ping = 1,
    Control = 2,
}

impl ClientAction {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Login),
            1 => Some(Self::Ping),
            2 => Some(Self::Control),
            _ => None,
        }
    }
}

/// Login request body.
///
/// Wire layout after the action byte: protocol_version u64 LE,
/// username `[u8; 32]` NUL-padded, verification_type u32 BE,
/// verification_size u8, verification_data `[u8; verification_size]`.
/// `verification_type` is opaque here and forwarded to the user service
/// untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientLogin {
    pub protocol_version: u64,
    pub username: String,
    pub verification_type: u32,
    pub verification_data: Vec<u8>,
}

impl ClientLogin {
    /// Fixed part of the body, before the variable verification data.
    pub const FIXED_LEN: usize = 8 + USERNAME_LEN + 4 + 1;

    pub fn decode(mut body: &[u8]) -> Result<Self, ProtocolError> {
        if body.len() < Self::FIXED_LEN {
            return Err(ProtocolError::Truncated);
        }
        let protocol_version = body.get_u64_le();
        let mut raw_name = [0u8; USERNAME_LEN];
        body.copy_to_slice(&mut raw_name);
        let name_len = raw_name.iter().position(|&b| b == 0).unwrap_or(USERNAME_LEN);
        let username = String::from_utf8_lossy(&raw_name[..name_len]).into_owned();
        let verification_type = body.get_u32();
        let verification_size = body.get_u8() as usize;
        if verification_size > VERIFICATION_DATA_MAX {
            return Err(ProtocolError::VerificationTooLarge(verification_size));
        }
        if body.remaining() < verification_size {
            return Err(ProtocolError::Truncated);
        }
        let verification_data = body[..verification_size].to_vec();
        Ok(Self {
            protocol_version,
            username,
            verification_type,
            verification_data,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.protocol_version);
        let mut raw_name = [0u8; USERNAME_LEN];
        let n = self.username.len().min(USERNAME_LEN);
        raw_name[..n].copy_from_slice(&self.username.as_bytes()[..n]);
        buf.put_slice(&raw_name);
        buf.put_u32(self.verification_type);
        buf.put_u8(self.verification_data.len().min(VERIFICATION_DATA_MAX) as u8);
        buf.put_slice(&self.verification_data[..self.verification_data.len().min(VERIFICATION_DATA_MAX)]);
    }
}

/// Body of the login-result packet sent after successful authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoginResult {
    pub protocol_version: u64,
    pub error_code: u32,
    pub audio_codec: u32,
    pub video_codec: u32,
}

impl LoginResult {
    pub const LEN: usize = 8 + 4 + 4 + 4;

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.protocol_version);
        buf.put_u32(self.error_code);
        buf.put_u32(self.audio_codec);
        buf.put_u32(self.video_codec);
    }

    pub fn decode(mut body: &[u8]) -> Result<Self, ProtocolError> {
        if body.len() < Self::LEN {
            return Err(ProtocolError::Truncated);
        }
        Ok(Self {
            protocol_version: body.get_u64_le(),
            error_code: body.get_u32(),
            audio_codec: body.get_u32(),
            video_codec: body.get_u32(),
        })
    }
}

/// Frames an ingress message: size prefix, action byte, body.
pub fn encode_client_message(action: ClientAction, body: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(PACKAGE_HEAD_LEN + 1 + body.len());
    buf.put_u32(1 + body.len() as u32);
    buf.put_u8(action as u8);
    buf.put_slice(body);
    buf
}
