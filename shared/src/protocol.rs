//! Binary framing protocol for Cok.
//!
//! A frame is an 8-byte header followed by a JSON payload:
//!
//! ```text
//! offset 0  : version      (u8, high nibble major, low nibble minor)
//! offset 1  : message_type (u8)
//! offset 2  : flags        (u8, reserved, send 0)
//! offset 3  : reserved     (u8, send 0)
//! offset 4-7: payload_len  (u32 big-endian)
//! offset 8..: payload      (message-type-specific JSON)
//! ```

use crate::{Error, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Major.minor encoded as a single byte: `(major << 4) | minor`.
pub const PROTOCOL_VERSION_MAJOR: u8 = 1;
pub const PROTOCOL_VERSION_MINOR: u8 = 0;
pub const PROTOCOL_VERSION: u8 = (PROTOCOL_VERSION_MAJOR << 4) | PROTOCOL_VERSION_MINOR;

/// Size of the fixed frame header, in bytes.
pub const FRAME_HEADER_LEN: usize = 8;

/// Maximum payload size (16 MiB).
pub const MAX_FRAME: usize = 16 * 1024 * 1024;

/// Wire message type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    ConnectRequest = 0x01,
    ConnectResponse = 0x02,
    HttpRequest = 0x10,
    HttpResponse = 0x11,
    Ping = 0x20,
    Pong = 0x21,
    Disconnect = 0x30,
    Error = 0xFF,
}

impl MessageType {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::ConnectRequest),
            0x02 => Some(Self::ConnectResponse),
            0x10 => Some(Self::HttpRequest),
            0x11 => Some(Self::HttpResponse),
            0x20 => Some(Self::Ping),
            0x21 => Some(Self::Pong),
            0x30 => Some(Self::Disconnect),
            0xFF => Some(Self::Error),
            _ => None,
        }
    }
}

/// A decoded (or about-to-be-encoded) frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub version: u8,
    pub message_type: u8,
    pub flags: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(message_type: MessageType, payload: Vec<u8>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            message_type: message_type as u8,
            flags: 0,
            payload,
        }
    }

    /// Build a frame carrying `value` JSON-encoded.
    pub fn encode_json<T: Serialize>(message_type: MessageType, value: &T) -> Result<Self> {
        let payload = serde_json::to_vec(value)?;
        Ok(Self::new(message_type, payload))
    }

    /// Decode this frame's payload as JSON.
    pub fn decode_json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::from_u8(self.message_type)
    }

    /// Serialize the header + payload for writing to the transport.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FRAME_HEADER_LEN + self.payload.len());
        out.push(self.version);
        out.push(self.message_type);
        out.push(self.flags);
        out.push(0); // reserved
        out.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Decode a frame from the front of `buf` without consuming it.
    ///
    /// Returns `Ok(None)` when fewer than `8 + payload_len` bytes are
    /// available — the transport layer must treat this as "read more",
    /// never as an error. Returns `Err` for a structural
    /// violation (unsupported version, oversized payload) that the
    /// caller must treat as fatal and close the connection on.
    pub fn decode(buf: &[u8]) -> Result<Option<(Frame, usize)>> {
        if buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let version = buf[0];
        if version >> 4 != PROTOCOL_VERSION_MAJOR {
            return Err(Error::Protocol(format!(
                "unsupported protocol version {version:#04x}"
            )));
        }

        let message_type = buf[1];
        let flags = buf[2];
        let payload_len = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;

        if payload_len > MAX_FRAME {
            return Err(Error::Protocol(format!(
                "frame too large: {payload_len} bytes exceeds {MAX_FRAME}"
            )));
        }

        let total = FRAME_HEADER_LEN + payload_len;
        if buf.len() < total {
            return Ok(None);
        }

        let payload = buf[FRAME_HEADER_LEN..total].to_vec();
        Ok(Some((
            Frame {
                version,
                message_type,
                flags,
                payload,
            },
            total,
        )))
    }
}

// ─── Typed payloads ───

/// Sent by the client as the first frame on a new control connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub api_key: String,
    pub requested_subdomain: Option<String>,
    pub client_version: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// Sent by the relay once a tunnel has been registered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectResponse {
    pub tunnel_id: uuid::Uuid,
    pub subdomain: String,
    pub session_token: String,
    pub public_url: String,
    pub expires_at: Option<i64>,
}

/// A public HTTP request forwarded to the tunnel client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpRequestMessage {
    pub request_id: uuid::Uuid,
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub body: Vec<u8>,
    pub remote_address: String,
}

/// The client's response to an `HttpRequestMessage`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpResponseMessage {
    pub request_id: uuid::Uuid,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingPayload {
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PongPayload {
    pub ping_timestamp: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DisconnectPayload {
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: u16,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_frame() -> Frame {
        Frame::encode_json(MessageType::Ping, &PingPayload { timestamp: 1_700_000_000 }).unwrap()
    }

    #[test]
    fn round_trip() {
        let frame = sample_frame();
        let encoded = frame.encode();
        let (decoded, consumed) = Frame::decode(&encoded).unwrap().unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded, frame);
    }

    #[test]
    fn partial_read_requests_more_data() {
        let frame = sample_frame();
        let encoded = frame.encode();
        for k in 0..encoded.len() {
            let result = Frame::decode(&encoded[..k]).unwrap();
            assert!(result.is_none(), "expected InsufficientData at k={k}");
        }
    }

    #[test]
    fn rejects_unsupported_major_version() {
        let mut encoded = sample_frame().encode();
        encoded[0] = 0x20; // major version 2
        assert!(matches!(Frame::decode(&encoded), Err(Error::Protocol(_))));
    }

    #[test]
    fn rejects_oversized_payload_len() {
        let mut encoded = sample_frame().encode();
        let too_big = (MAX_FRAME as u32) + 1;
        encoded[4..8].copy_from_slice(&too_big.to_be_bytes());
        assert!(matches!(Frame::decode(&encoded), Err(Error::Protocol(_))));
    }

    #[test]
    fn unknown_message_type_is_not_a_decode_error() {
        let mut encoded = sample_frame().encode();
        encoded[1] = 0x99;
        let (decoded, _) = Frame::decode(&encoded).unwrap().unwrap();
        assert_eq!(decoded.message_type(), None);
    }
}
