//! Hub link framing.
//!
//! Every frame is a big-endian `u32` length followed by a bincode-encoded
//! [`Frame`]. Collective payloads are themselves bincode bytes, opaque to the
//! framing layer.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Largest frame accepted from a peer (64MB).
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Reduction applied by `all_reduce`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ReduceOp {
    #[default]
    Sum,
    Product,
    Min,
    Max,
}

impl std::fmt::Display for ReduceOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sum => write!(f, "sum"),
            Self::Product => write!(f, "product"),
            Self::Min => write!(f, "min"),
            Self::Max => write!(f, "max"),
        }
    }
}

/// Which collective a contribution belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpCode {
    Barrier,
    Broadcast { source: u32 },
    AllGather,
    AllReduce { op: ReduceOp },
}

impl std::fmt::Display for OpCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Barrier => write!(f, "barrier"),
            Self::Broadcast { source } => write!(f, "broadcast(source={source})"),
            Self::AllGather => write!(f, "all_gather"),
            Self::AllReduce { op } => write!(f, "all_reduce({op})"),
        }
    }
}

/// Messages on a hub link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// Spoke to hub: first frame on a new link.
    Hello { rank: u32, world_size: u32 },
    /// Hub to spoke: every rank has joined.
    Welcome { world_size: u32 },
    /// Hub to spoke: this link is refused.
    Reject { reason: String },
    /// Spoke to hub: this member's input to collective `seq`.
    Contribute { seq: u64, op: OpCode, payload: Vec<u8> },
    /// Hub to spoke: the combined output of collective `seq`.
    Result { seq: u64, payload: Vec<u8> },
    /// Hub to spoke: the group failed.
    Abort { reason: String },
    /// Either side: leaving the group.
    Goodbye { rank: u32 },
}

/// Write one frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<()> {
    let body = bincode::serialize(frame)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(Error::FrameTooLarge(body.len()));
    }

    let len = u32::try_from(body.len()).map_err(|_| Error::FrameTooLarge(body.len()))?;
    let mut buf = Vec::with_capacity(4 + body.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&body);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame> {
    let len = reader.read_u32().await? as usize;
    if len > MAX_FRAME_LEN {
        return Err(Error::FrameTooLarge(len));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(bincode::deserialize(&body)?)
}

/// Encode a collective payload.
pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

/// Decode a collective payload.
pub(crate) fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_over_a_pipe() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        let frames = vec![
            Frame::Hello { rank: 3, world_size: 4 },
            Frame::Contribute {
                seq: 7,
                op: OpCode::AllReduce { op: ReduceOp::Max },
                payload: vec![1, 2, 3],
            },
            Frame::Abort { reason: "rank 2 left".into() },
        ];
        for frame in &frames {
            write_frame(&mut a, frame).await.unwrap();
        }
        for frame in &frames {
            assert_eq!(&read_frame(&mut b).await.unwrap(), frame);
        }
    }

    #[tokio::test]
    async fn test_oversized_length_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&u32::MAX.to_be_bytes()).await.unwrap();
        assert!(matches!(read_frame(&mut b).await, Err(Error::FrameTooLarge(_))));
    }

    #[tokio::test]
    async fn test_eof_is_io_error() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        assert!(matches!(read_frame(&mut b).await, Err(Error::Io(_))));
    }
}
