//! The inbound pump of a reliable channel: drives a [`MessageDecoder`] from the channel's
//!  chunk stream and dispatches each fully decoded message, in arrival order, to a registered
//!  callback.

use crate::channel::{Channel, ChannelRole};
use crate::message_decoder::MessageDecoder;
use crate::session_messages::SessionMessage;
use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// The application-side consumer of decoded messages. Invoked on the reader's own task, never
///  from the channel's I/O pumps.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn on_message(&self, role: ChannelRole, message: SessionMessage);
}

pub struct MessageReader {
    channel: Arc<Channel>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for MessageReader {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.lock().unwrap().take() {
            handle.abort();
        }
    }
}

impl MessageReader {
    /// Attach to `channel`'s inbound stream. Fails if another reader already took the stream.
    ///
    /// A framing/decode error tears the channel down (the stream can no longer be trusted); a
    ///  channel reaching a terminal state mid-frame is not an error - the incomplete frame is
    ///  discarded silently.
    pub fn spawn(channel: Arc<Channel>, handler: Arc<dyn MessageHandler>) -> anyhow::Result<MessageReader> {
        let mut inbound = channel.take_inbound()
            .with_context(|| format!("inbound stream of channel {} is already consumed", channel.role()))?;

        let handle = {
            let channel = channel.clone();
            tokio::spawn(async move {
                let role = channel.role();
                let mut decoder = MessageDecoder::new(channel.config().max_frame_size);
                let mut state_rx = channel.subscribe_state();

                loop {
                    let chunk = tokio::select! {
                        chunk = inbound.recv() => chunk,
                        _ = state_rx.changed() => {
                            if state_rx.borrow().is_terminal() {
                                // dispatch what already arrived, then stop
                                Self::drain(&channel, &mut inbound, &mut decoder, handler.as_ref()).await;
                                break;
                            }
                            continue;
                        }
                    };

                    match chunk {
                        Some(chunk) => {
                            if !Self::process_chunk(&channel, &mut decoder, handler.as_ref(), chunk).await {
                                break;
                            }
                        }
                        None => break,
                    }
                }

                if decoder.pending_bytes() > 0 {
                    debug!("channel {}: discarding an incomplete frame of {} bytes on teardown", role, decoder.pending_bytes());
                }
            })
        };

        Ok(MessageReader {
            channel,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    /// Detach from the channel. A partially decoded, not-yet-complete frame is discarded
    ///  without error.
    pub async fn close(&self) {
        if let Some(handle) = self.handle.lock().unwrap().take() {
            handle.abort();
            let _ = handle.await;
        }
    }

    /// returns false when the channel is done for (decode error)
    async fn process_chunk(
        channel: &Arc<Channel>,
        decoder: &mut MessageDecoder,
        handler: &dyn MessageHandler,
        chunk: Bytes,
    ) -> bool {
        if let Err(e) = decoder.feed(chunk) {
            warn!("channel {}: broken inbound stream: {:#}", channel.role(), e);
            channel.fail(&format!("broken inbound stream: {}", e));
            return false;
        }
        while let Some(message) = decoder.next_message() {
            handler.on_message(channel.role(), message).await;
        }
        true
    }

    async fn drain(
        channel: &Arc<Channel>,
        inbound: &mut tokio::sync::mpsc::UnboundedReceiver<Bytes>,
        decoder: &mut MessageDecoder,
        handler: &dyn MessageHandler,
    ) {
        while let Ok(chunk) = inbound.try_recv() {
            if !Self::process_chunk(channel, decoder, handler, chunk).await {
                break;
            }
        }
    }
}
