//! Frames exchanged by the TCP provider: `[len: u32 LE][rkyv payload]`.

use crate::error::{Result, SkeinError};

/// Size of a TCP endpoint name.
pub const TCP_ADDR_LEN: usize = 24;

pub type WireName = [u8; TCP_ADDR_LEN];

/// Largest accepted frame payload.
pub const MAX_FRAME_SIZE: usize = 1 << 30;

pub const LEN_PREFIX: usize = 4;

#[derive(rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, PartialEq)]
pub enum Frame {
    /// Tagged message from transmit context `tx_ctx` to receive context `rx_ctx`.
    Tagged {
        src: WireName,
        tx_ctx: u32,
        rx_ctx: u32,
        tag: u64,
        payload: Vec<u8>,
    },
    ReadReq {
        src: WireName,
        req_id: u64,
        key: u64,
        addr: u64,
        len: u64,
    },
    ReadResp {
        req_id: u64,
        ok: bool,
        payload: Vec<u8>,
    },
    WriteReq {
        src: WireName,
        req_id: u64,
        key: u64,
        addr: u64,
        payload: Vec<u8>,
    },
    WriteAck {
        req_id: u64,
        ok: bool,
    },
}

/// Encode a frame with its length prefix.
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>> {
    let payload = rkyv::to_bytes::<rkyv::rancor::Error>(frame)
        .map_err(|e| SkeinError::Codec(e.to_string()))?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(SkeinError::Codec(format!(
            "frame of {} bytes exceeds {MAX_FRAME_SIZE}",
            payload.len()
        )));
    }
    let mut buf = Vec::with_capacity(LEN_PREFIX + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Decode a frame payload (without the length prefix).
pub fn decode_frame(payload: &[u8]) -> Result<Frame> {
    // rkyv validates alignment; socket buffers carry none.
    let mut aligned = rkyv::util::AlignedVec::<16>::with_capacity(payload.len());
    aligned.extend_from_slice(payload);
    rkyv::from_bytes::<Frame, rkyv::rancor::Error>(&aligned)
        .map_err(|e| SkeinError::Codec(e.to_string()))
}
