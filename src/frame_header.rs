use crate::safe_converter::PrecheckedCast;
use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};

/// The length prefix preceding each serialized message on a channel's byte stream. The prefix
///  counts exactly the body's bytes (message kind discriminator included, prefix excluded).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    pub body_len: u32,
}

impl FrameHeader {
    pub const SERIALIZED_LEN: usize = size_of::<u32>();

    pub(crate) fn for_body(body: &[u8]) -> FrameHeader {
        FrameHeader {
            body_len: body.len().prechecked_cast(),
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32(self.body_len);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<FrameHeader> {
        let body_len = buf.try_get_u32()?;
        Ok(FrameHeader {
            body_len,
        })
    }

    /// Plausibility check against the configured frame-size bound. An implausible prefix means
    ///  the stream is corrupted (or hostile), and the caller must stop decoding it.
    pub fn validate(&self, max_frame_size: u32) -> anyhow::Result<()> {
        if self.body_len == 0 {
            bail!("frame with empty body - there is no message kind to read");
        }
        if self.body_len > max_frame_size {
            bail!("frame body of {} bytes exceeds the configured maximum of {}", self.body_len, max_frame_size);
        }
        Ok(())
    }
}
