//! Incremental reconstruction of framed messages from a byte stream whose arrival is chunked
//!  arbitrarily by the underlying transport.
//!
//! The decoder never requires a read to align with a frame boundary: a message may be split
//!  across any number of `feed()` calls (one byte at a time included), and a single call may
//!  complete several messages. Incoming chunks are kept as shared chunks of a
//!  [`CompoundBuffer`]; a completed frame is sliced out structurally and parsed through a
//!  [`ZeroCopyReader`], so a message straddling chunk boundaries is deserialized without first
//!  being copied into one contiguous buffer.

use crate::buffers::compound_buffer::{CompoundBuffer, ZeroCopyReader};
use crate::frame_header::FrameHeader;
use crate::safe_converter::SafeCast;
use crate::session_messages::SessionMessage;
use anyhow::bail;
use bytes::Bytes;
use std::collections::VecDeque;
use tracing::trace;

pub struct MessageDecoder {
    max_frame_size: u32,

    /// Holds exactly the not-yet-consumed tail of the stream: the current incomplete frame
    ///  (prefix and partial body), preceded by nothing - completed frames are cropped off the
    ///  front as soon as they are parsed.
    pending: CompoundBuffer,

    /// The already-validated body length of the frame currently at the front of `pending`, so
    ///  the prefix is not re-validated on every `feed()` while a large body trickles in.
    current_body_len: Option<usize>,

    decoded: VecDeque<SessionMessage>,
}

impl MessageDecoder {
    pub fn new(max_frame_size: u32) -> MessageDecoder {
        MessageDecoder {
            max_frame_size,
            pending: CompoundBuffer::new(),
            current_body_len: None,
            decoded: VecDeque::new(),
        }
    }

    /// Consume a raw chunk and decode every message it completes, in stream order. The decoded
    ///  messages are retrieved with [`next_message`](Self::next_message).
    ///
    /// An error means the stream itself is broken (implausible length prefix, malformed body):
    ///  the caller must stop feeding this decoder and tear down the channel - after a framing
    ///  error, every subsequent byte would be misinterpreted.
    pub fn feed(&mut self, chunk: Bytes) -> anyhow::Result<()> {
        if chunk.is_empty() {
            trace!("feed of zero bytes - nothing to do");
            return Ok(());
        }
        self.pending.append(chunk);

        loop {
            let body_len = match self.current_body_len {
                Some(len) => len,
                None => {
                    if self.pending.total_bytes() < FrameHeader::SERIALIZED_LEN {
                        break;
                    }
                    let header = self.parse_header()?;
                    let len = header.body_len.safe_cast();
                    self.current_body_len = Some(len);
                    len
                }
            };

            if self.pending.total_bytes() < FrameHeader::SERIALIZED_LEN + body_len {
                // wait for more data - the validated prefix stays cached in current_body_len
                break;
            }

            let message = self.parse_body(body_len)?;
            trace!("decoded {:?} message of {} body bytes", message.kind(), body_len);

            self.pending.crop_front(FrameHeader::SERIALIZED_LEN + body_len);
            self.current_body_len = None;
            self.decoded.push_back(message);
        }

        Ok(())
    }

    /// The next fully decoded message, in arrival order.
    pub fn next_message(&mut self) -> Option<SessionMessage> {
        self.decoded.pop_front()
    }

    /// Bytes of the current, not-yet-complete frame.
    pub fn pending_bytes(&self) -> usize {
        self.pending.total_bytes()
    }

    fn parse_header(&self) -> anyhow::Result<FrameHeader> {
        let mut prefix = [0u8; FrameHeader::SERIALIZED_LEN];
        {
            let mut dest: &mut [u8] = &mut prefix;
            self.pending.slice(0, FrameHeader::SERIALIZED_LEN).copy_into(&mut dest);
        }

        let header = FrameHeader::deser(&mut prefix.as_slice())?;
        header.validate(self.max_frame_size)?;
        Ok(header)
    }

    fn parse_body(&self, body_len: usize) -> anyhow::Result<SessionMessage> {
        let mut frame = self.pending.slice(FrameHeader::SERIALIZED_LEN, FrameHeader::SERIALIZED_LEN + body_len);
        frame.lock();

        let mut reader = ZeroCopyReader::new(&frame);
        let message = SessionMessage::deser(&mut reader)?;

        if reader.bytes_consumed() != body_len {
            bail!("frame declares a body of {} bytes but the message ends after {}", body_len, reader.bytes_consumed());
        }
        Ok(message)
    }
}
