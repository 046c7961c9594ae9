//! The outbound pump of a reliable channel: serializes a message, prepends the frame header,
//!  and hands the frame to the channel's write queue.

use crate::channel::Channel;
use crate::frame_header::FrameHeader;
use crate::session_messages::SessionMessage;
use anyhow::bail;
use bytes::{BufMut, BytesMut};
use std::sync::Arc;
use tracing::trace;

pub struct MessageWriter {
    channel: Arc<Channel>,
}

impl MessageWriter {
    pub fn new(channel: Arc<Channel>) -> MessageWriter {
        MessageWriter { channel }
    }

    /// Frame and enqueue a message. The message counts as pending until the transport has
    ///  accepted its last byte.
    pub fn send_message(&self, message: &SessionMessage) -> anyhow::Result<()> {
        let mut body = BytesMut::new();
        message.ser(&mut body);

        if body.len() > self.channel.config().max_frame_size as usize {
            bail!("{:?} message of {} bytes exceeds the configured frame maximum of {}",
                message.kind(), body.len(), self.channel.config().max_frame_size);
        }

        let mut frame = BytesMut::with_capacity(FrameHeader::SERIALIZED_LEN + body.len());
        FrameHeader::for_body(&body).ser(&mut frame);
        frame.put_slice(&body);

        trace!("channel {}: enqueueing {:?} message of {} body bytes",
            self.channel.role(), message.kind(), body.len());
        self.channel.write(frame.freeze())
    }

    /// How many messages have been enqueued but not yet fully flushed to the transport. This is
    ///  the backpressure signal for the application: producers throttle on it instead of
    ///  tracking raw byte counts.
    ///
    /// One frame is one write-queue entry, so this is exact as long as this writer is the
    ///  channel's only producer - which the ownership model guarantees.
    pub fn pending_message_count(&self) -> usize {
        self.channel.pending_write_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelRole;
    use crate::config::TransportConfig;
    use crate::session_messages::{ControlMessage, EventMessage, VideoPacket};
    use crate::test_util::{wait_until, ScriptedTransport};
    use bytes::Bytes;
    use tokio::sync::mpsc;

    fn new_writer(config: TransportConfig, max_write: usize, gated: bool) -> (MessageWriter, Arc<Channel>, Arc<ScriptedTransport>, mpsc::UnboundedSender<anyhow::Result<Bytes>>) {
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let channel = Channel::new(ChannelRole::Control, Arc::new(config), events_tx);
        let (transport, inbound) = if gated {
            ScriptedTransport::gated(max_write)
        }
        else {
            ScriptedTransport::new(max_write)
        };
        channel.connect(transport.clone()).unwrap();
        (MessageWriter::new(channel.clone()), channel, transport, inbound)
    }

    #[tokio::test]
    async fn test_sent_message_is_framed_on_the_wire() {
        let (writer, channel, transport, _inbound) = new_writer(TransportConfig::default(), usize::MAX, false);

        let message = SessionMessage::Event(EventMessage::MouseMove { x: 10, y: -20 });
        writer.send_message(&message).unwrap();

        let mut body = BytesMut::new();
        message.ser(&mut body);
        let mut expected = BytesMut::new();
        FrameHeader::for_body(&body).ser(&mut expected);
        expected.put_slice(&body);

        wait_until(|| writer.pending_message_count() == 0).await;
        assert_eq!(transport.written(), expected.as_ref());

        channel.close().await;
    }

    #[tokio::test]
    async fn test_pending_message_count_reflects_unflushed_messages() {
        let (writer, channel, transport, _inbound) = new_writer(TransportConfig::default(), usize::MAX, true);

        for i in 0..5u32 {
            writer.send_message(&SessionMessage::Event(EventMessage::Key { keycode: i, pressed: true })).unwrap();
        }
        assert_eq!(writer.pending_message_count(), 5);

        // each released write flushes exactly one frame (the transport accepts whole buffers)
        transport.release_writes(2);
        wait_until(|| writer.pending_message_count() == 3).await;

        transport.release_writes(3);
        wait_until(|| writer.pending_message_count() == 0).await;

        channel.close().await;
    }

    #[tokio::test]
    async fn test_oversized_message_is_rejected_before_queueing() {
        let config = TransportConfig {
            max_frame_size: 16,
            ..TransportConfig::default()
        };
        let (writer, channel, _transport, _inbound) = new_writer(config, usize::MAX, false);

        let message = SessionMessage::Video(VideoPacket {
            flags: 0,
            sequence_number: 1,
            data: Bytes::from(vec![0u8; 64]),
        });
        assert!(writer.send_message(&message).is_err());
        assert_eq!(writer.pending_message_count(), 0);

        channel.close().await;
    }

    #[tokio::test]
    async fn test_send_after_channel_close_is_rejected() {
        let (writer, channel, _transport, _inbound) = new_writer(TransportConfig::default(), usize::MAX, false);
        channel.close().await;

        assert!(writer.send_message(&SessionMessage::Control(ControlMessage::EndSession)).is_err());
    }
}
