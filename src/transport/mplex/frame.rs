use crate::error::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Frame flags
pub const FLAG_SYN: u8 = 0x01; // Open stream
pub const FLAG_FIN: u8 = 0x04; // Half-close stream
pub const FLAG_RST: u8 = 0x08; // Reset stream (abort)

const KNOWN_FLAGS: u8 = FLAG_SYN | FLAG_FIN | FLAG_RST;

/// Frame header size (stream_id + flags + length)
pub const HEADER_SIZE: usize = 7;

/// Maximum frame size (64 KB - 1 byte)
pub const MAX_FRAME_SIZE: usize = 65535;

/// Maximum data payload per frame (accounting for the header)
pub const MAX_DATA_SIZE: usize = MAX_FRAME_SIZE - HEADER_SIZE;

/// Multiplexer frame
///
/// Wire format:
/// ```text
/// [stream_id: u32][flags: u8][length: u16][data: bytes]
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Stream identifier
    pub stream_id: u32,

    /// Control flags (SYN, FIN, RST); zero for data frames
    pub flags: u8,

    /// Data payload
    pub data: Bytes,
}

impl Frame {
    pub fn new(stream_id: u32, flags: u8, data: Bytes) -> Self {
        Self {
            stream_id,
            flags,
            data,
        }
    }

    /// Create a SYN frame to open a stream
    pub fn syn(stream_id: u32) -> Self {
        Self::new(stream_id, FLAG_SYN, Bytes::new())
    }

    /// Create a data frame
    pub fn data(stream_id: u32, data: Bytes) -> Self {
        Self::new(stream_id, 0, data)
    }

    /// Create a FIN frame to half-close a stream
    pub fn fin(stream_id: u32) -> Self {
        Self::new(stream_id, FLAG_FIN, Bytes::new())
    }

    /// Create a RST frame to reset a stream
    pub fn rst(stream_id: u32) -> Self {
        Self::new(stream_id, FLAG_RST, Bytes::new())
    }

    pub fn is_syn(&self) -> bool {
        self.flags & FLAG_SYN != 0
    }

    pub fn is_fin(&self) -> bool {
        self.flags & FLAG_FIN != 0
    }

    pub fn is_rst(&self) -> bool {
        self.flags & FLAG_RST != 0
    }
}

/// Length-prefixed codec for [`Frame`]s.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_data_size: usize,
}

impl FrameCodec {
    pub fn new(max_data_size: usize) -> Self {
        Self {
            max_data_size: max_data_size.min(MAX_DATA_SIZE),
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(MAX_DATA_SIZE)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        let data_len = frame.data.len();
        if data_len > self.max_data_size {
            return Err(Error::PacketTooLarge(data_len, self.max_data_size));
        }

        dst.reserve(HEADER_SIZE + data_len);
        dst.put_u32(frame.stream_id);
        dst.put_u8(frame.flags);
        dst.put_u16(data_len as u16);
        dst.put_slice(&frame.data);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let flags = src[4];
        if flags & !KNOWN_FLAGS != 0 {
            return Err(Error::Protocol(format!("Unknown frame flags: {:02x}", flags)));
        }

        let length = u16::from_be_bytes([src[5], src[6]]) as usize;
        if length > self.max_data_size {
            return Err(Error::PacketTooLarge(length, self.max_data_size));
        }

        if src.len() < HEADER_SIZE + length {
            src.reserve(HEADER_SIZE + length - src.len());
            return Ok(None);
        }

        let stream_id = src.get_u32();
        let flags = src.get_u8();
        let _ = src.get_u16();
        let data = src.split_to(length).freeze();

        Ok(Some(Frame::new(stream_id, flags, data)))
    }
}
