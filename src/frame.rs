//! Wire envelope for link-layer frames
//!
//! Each frame travels as a 2-byte little-endian length followed by exactly
//! that many payload bytes. Frame contents are never inspected.

use crate::error::EnclaveError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Size of the length prefix
pub const LENGTH_PREFIX_LEN: usize = 2;

/// Largest payload the prefix can describe
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;

/// Default interface MTU
pub const DEFAULT_MTU: usize = 4000;

/// Ethernet header allowance on top of the MTU
pub const ETHERNET_HEADER_LEN: usize = 14;

/// Length-prefixed frame codec
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_len: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::for_mtu(DEFAULT_MTU)
    }
}

impl FrameCodec {
    /// Codec accepting frames up to `max_frame_len` bytes (capped at 65535)
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            max_frame_len: max_frame_len.min(MAX_FRAME_LEN),
        }
    }

    /// Codec accepting frames of an interface with the given MTU
    pub fn for_mtu(mtu: usize) -> Self {
        Self::new(mtu + ETHERNET_HEADER_LEN)
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = EnclaveError;

    fn encode(&mut self, frame: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if frame.len() > self.max_frame_len {
            return Err(EnclaveError::ProtocolViolation(format!(
                "frame of {} bytes exceeds limit of {}",
                frame.len(),
                self.max_frame_len
            )));
        }
        dst.reserve(LENGTH_PREFIX_LEN + frame.len());
        dst.put_u16_le(frame.len() as u16);
        dst.extend_from_slice(&frame);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = EnclaveError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_PREFIX_LEN {
            src.reserve(LENGTH_PREFIX_LEN - src.len());
            return Ok(None);
        }

        let size = u16::from_le_bytes([src[0], src[1]]) as usize;
        if size > self.max_frame_len {
            return Err(EnclaveError::ProtocolViolation(format!(
                "length prefix {} exceeds limit of {}",
                size, self.max_frame_len
            )));
        }

        let total = LENGTH_PREFIX_LEN + size;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_LEN);
        Ok(Some(src.split_to(size).freeze()))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None if src.len() < LENGTH_PREFIX_LEN => Err(EnclaveError::ProtocolViolation(
                "stream closed inside a length prefix".to_string(),
            )),
            None => {
                let expected = u16::from_le_bytes([src[0], src[1]]) as usize;
                Err(EnclaveError::ProtocolViolation(format!(
                    "expected frame of size {} but stream closed after {}",
                    expected,
                    src.len() - LENGTH_PREFIX_LEN
                )))
            }
        }
    }
}
