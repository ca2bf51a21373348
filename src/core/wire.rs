//! Wire format of the peer-to-peer application protocol.
//!
//! Every frame on a connection is a 4-byte big-endian length followed by a
//! JSON body. Bodies are one of three structurally-distinguished shapes:
//! a one-off `Hello` identifying the sending peer, a broadcast [`Packet`]
//! envelope, or a request/response [`RrMessage`] envelope.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::core::error::SessionError;
use crate::core::types::MinedBlock;

/// Upper bound on a single frame body; a peer announcing more is dropped.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Broadcast packet `type` values.
pub const TYPE_TRANSACTION: &str = "transaction";
pub const TYPE_BLOCK: &str = "block";
pub const TYPE_PUBLIC_KEY_SHARE: &str = "publicKeyShare";

/// Request/response `type` values.
pub const REQ_OTHER_PUBLIC_KEY: &str = "requestOtherPublicKey";
pub const REQ_GET_ALL_BLOCKS: &str = "getAllBlocks";

/// Fire-and-forget application packet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Packet {
    pub sender: String,
    pub receivers: Vec<String>,
    #[serde(rename = "type")]
    pub packet_type: String,
    pub data: Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RrKind {
    Request,
    Response,
}

/// One-shot request/response envelope, multiplexed over a connection by
/// `request_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RrMessage {
    pub kind: RrKind,
    pub request_id: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub payload_type: Option<String>,
    pub payload: Value,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

/// Body of a request: the handler-routing type plus its payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestPayload {
    #[serde(rename = "type")]
    pub request_type: String,
    pub payload: Value,
}

/// Everything that can travel over a connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Frame {
    Hello {
        #[serde(rename = "helloFrom")]
        hello_from: String,
    },
    Rr(RrMessage),
    Packet(Packet),
}

/// Typed payloads of the known message types.
pub mod payloads {
    use super::*;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct PublicKeyShare {
        #[serde(rename = "publicKey")]
        pub public_key: String,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct RequestOtherPublicKey {
        pub peer: String,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ResponsePublicKey {
        #[serde(rename = "publicKey")]
        pub public_key: Option<String>,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct AllBlocks {
        pub blocks: Vec<MinedBlock>,
    }
}

pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), SessionError> {
    let body = serde_json::to_vec(frame)?;
    let len = (body.len() as u32).to_be_bytes();
    writer.write_all(&len).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, SessionError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(SessionError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        )));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    let frame = serde_json::from_slice(&body)?;
    Ok(frame)
}
