//! Messages between KVS clients and the server: `[len: u32 LE][rkyv payload]`.

use crate::error::{KvsError, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest accepted message payload.
pub const MAX_MESSAGE_SIZE: usize = 64 << 20;

const LEN_PREFIX: usize = 4;

#[derive(rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, PartialEq)]
pub struct Entry {
    pub key: String,
    pub value: Vec<u8>,
}

#[derive(rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, PartialEq)]
pub enum Request {
    /// First message on a connection.
    Hello { rank: u32, size: u32 },
    Put { key: String, value: Vec<u8> },
    Get { key: String },
    /// Publish staged PMIx entries of `rank`.
    Commit { rank: u32, entries: Vec<Entry> },
    /// Committed entry of `rank`.
    GetCommitted { rank: u32, key: String },
    Barrier,
    Fence,
}

#[derive(rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, PartialEq)]
pub enum Reply {
    Ok,
    Value(Vec<u8>),
    NotFound,
    /// Barrier or fence released; carries the generation.
    Released(u64),
    Error(String),
}

fn frame(payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(KvsError::Codec(format!(
            "message of {} bytes exceeds {MAX_MESSAGE_SIZE}",
            payload.len()
        )));
    }
    let mut buf = Vec::with_capacity(LEN_PREFIX + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

fn aligned(payload: &[u8]) -> rkyv::util::AlignedVec<16> {
    let mut buf = rkyv::util::AlignedVec::<16>::with_capacity(payload.len());
    buf.extend_from_slice(payload);
    buf
}

pub fn encode_request(req: &Request) -> Result<Vec<u8>> {
    let bytes =
        rkyv::to_bytes::<rkyv::rancor::Error>(req).map_err(|e| KvsError::Codec(e.to_string()))?;
    frame(&bytes)
}

pub fn decode_request(payload: &[u8]) -> Result<Request> {
    rkyv::from_bytes::<Request, rkyv::rancor::Error>(&aligned(payload))
        .map_err(|e| KvsError::Codec(e.to_string()))
}

pub fn encode_reply(reply: &Reply) -> Result<Vec<u8>> {
    let bytes =
        rkyv::to_bytes::<rkyv::rancor::Error>(reply).map_err(|e| KvsError::Codec(e.to_string()))?;
    frame(&bytes)
}

pub fn decode_reply(payload: &[u8]) -> Result<Reply> {
    rkyv::from_bytes::<Reply, rkyv::rancor::Error>(&aligned(payload))
        .map_err(|e| KvsError::Codec(e.to_string()))
}

/// Read one message payload; `None` on a clean end of stream.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; LEN_PREFIX];
    match r.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(KvsError::Protocol(format!("frame length {len} exceeds limit")));
    }
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, framed: &[u8]) -> Result<()> {
    w.write_all(framed).await?;
    w.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_roundtrip() {
        let req = Request::Commit {
            rank: 3,
            entries: vec![Entry {
                key: "RANK_EP_ADDRS_3".into(),
                value: vec![0xab; 40],
            }],
        };
        let buf = encode_request(&req).unwrap();
        assert_eq!(
            u32::from_le_bytes(buf[..LEN_PREFIX].try_into().unwrap()) as usize,
            buf.len() - LEN_PREFIX
        );
        assert_eq!(decode_request(&buf[LEN_PREFIX..]).unwrap(), req);
    }

    #[test]
    fn test_reply_rejects_garbage() {
        assert!(decode_reply(&[0xee; 3]).is_err());
    }

    #[tokio::test]
    async fn test_frame_over_stream() {
        let (mut a, mut b) = tokio::io::duplex(256);
        let framed = encode_reply(&Reply::Released(9)).unwrap();
        write_frame(&mut a, &framed).await.unwrap();
        drop(a);
        let payload = read_frame(&mut b).await.unwrap().unwrap();
        assert_eq!(decode_reply(&payload).unwrap(), Reply::Released(9));
        assert!(read_frame(&mut b).await.unwrap().is_none());
    }
}
