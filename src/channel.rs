//! A channel wraps one transport stream of a session and owns its lifecycle: inbound read
//!  pumping, outbound write queueing with asynchronous completion, and a connection-style state
//!  machine. Several channels with different roles are multiplexed into a
//!  [`Connection`](crate::connection::Connection).
//!
//! Concurrency model: the pumps are spawned tasks; application threads touch the channel only
//!  through `write()` (guarded by a lock that is held for the queue mutation itself, never
//!  across a transport call) and through `close()`. Inbound data and state changes are posted
//!  onto queues consumed elsewhere, never delivered synchronously from the pump tasks.

use crate::config::TransportConfig;
use crate::transport::TransportStream;
use anyhow::bail;
use bytes::Bytes;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

/// The fixed set of logical streams a session multiplexes. Each role maps to exactly one
///  underlying transport stream per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelRole {
    /// session control directives
    Control,
    /// input events
    Event,
    /// legacy single-stream video
    Video,
    /// unreliable streaming video
    VideoRtp,
    /// control messages for the unreliable video stream
    VideoRtcp,
}

impl ChannelRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelRole::Control => "control",
            ChannelRole::Event => "event",
            ChannelRole::Video => "video",
            ChannelRole::VideoRtp => "video-rtp",
            ChannelRole::VideoRtcp => "video-rtcp",
        }
    }

    /// Reliable roles carry framed messages over a stream transport; unreliable roles move
    ///  datagrams whose loss is visible to the consumer.
    pub fn is_reliable(&self) -> bool {
        !matches!(self, ChannelRole::VideoRtp | ChannelRole::VideoRtcp)
    }
}

impl fmt::Display for ChannelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Initializing,
    Connecting,
    Open,
    Closed,
    Failed,
}

impl ChannelState {
    /// Terminal states service no further reads or writes.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChannelState::Closed | ChannelState::Failed)
    }

    fn is_legal_transition_to(self, to: ChannelState) -> bool {
        use ChannelState::*;
        matches!((self, to), (Initializing, Connecting) | (Connecting, Open))
            || (!self.is_terminal() && to.is_terminal())
    }
}

/// Published to the owning connection on every state change.
#[derive(Debug, Clone)]
pub struct ChannelEvent {
    pub role: ChannelRole,
    pub state: ChannelState,
    pub reason: Option<String>,
}

struct WriteEntry {
    buf: Bytes,
    /// how much of `buf` the transport has already accepted
    offset: usize,
}

#[derive(Default)]
struct WriteQueue {
    entries: VecDeque<WriteEntry>,
    /// invariant: the sum of unsent bytes across all queued entries
    queued_bytes: usize,
}

pub struct Channel {
    role: ChannelRole,
    config: Arc<TransportConfig>,

    state_tx: watch::Sender<ChannelState>,
    events: mpsc::UnboundedSender<ChannelEvent>,

    write_queue: Mutex<WriteQueue>,
    write_notify: Notify,

    inbound_tx: mpsc::UnboundedSender<Bytes>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Bytes>>>,

    transport: Mutex<Option<Arc<dyn TransportStream>>>,
    pump_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Channel {
    pub fn new(
        role: ChannelRole,
        config: Arc<TransportConfig>,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Arc<Channel> {
        let (state_tx, _) = watch::channel(ChannelState::Initializing);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        Arc::new(Channel {
            role,
            config,
            state_tx,
            events,
            write_queue: Mutex::new(WriteQueue::default()),
            write_notify: Notify::new(),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            transport: Mutex::new(None),
            pump_handles: Mutex::new(Vec::new()),
        })
    }

    pub fn role(&self) -> ChannelRole {
        self.role
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn state(&self) -> ChannelState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ChannelState> {
        self.state_tx.subscribe()
    }

    /// Attach the channel to an established transport stream and start its pumps.
    pub fn connect(self: &Arc<Self>, transport: Arc<dyn TransportStream>) -> anyhow::Result<()> {
        self.transition(ChannelState::Connecting, None)?;
        *self.transport.lock().unwrap() = Some(transport.clone());
        self.spawn_pumps(transport);
        self.transition(ChannelState::Open, None)?;
        Ok(())
    }

    /// The channel's inbound chunk stream, handed out once (typically to a
    ///  [`MessageReader`](crate::message_reader::MessageReader)). Chunks arrive in stream order.
    pub fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<Bytes>> {
        self.inbound_rx.lock().unwrap().take()
    }

    /// Enqueue a buffer for sending. Buffers are flushed strictly in enqueue order; a
    ///  zero-length write is discarded without queueing.
    pub fn write(&self, buf: Bytes) -> anyhow::Result<()> {
        if buf.is_empty() {
            trace!("channel {}: discarding zero-length write", self.role);
            return Ok(());
        }

        let state = self.state();
        if state.is_terminal() {
            bail!("channel {} is {:?} and does not accept writes", self.role, state);
        }

        {
            let mut queue = self.write_queue.lock().unwrap();
            queue.queued_bytes += buf.len();
            queue.entries.push_back(WriteEntry { buf, offset: 0 });
        }

        // the channel may have reached a terminal state while we were enqueueing - in that case
        //  the entry must not linger in the queue
        if self.state().is_terminal() {
            self.discard_write_queue();
            bail!("channel {} was torn down concurrently with the write", self.role);
        }

        self.write_notify.notify_one();
        Ok(())
    }

    /// The number of queued buffers not yet fully accepted by the transport.
    pub fn pending_write_count(&self) -> usize {
        self.write_queue.lock().unwrap().entries.len()
    }

    /// The number of unsent bytes across all queued buffers.
    pub fn queued_write_bytes(&self) -> usize {
        self.write_queue.lock().unwrap().queued_bytes
    }

    /// Close the channel and wait until it has reached a terminal state: the pumps have exited,
    ///  queued-but-unsent data is discarded, and the transport reference is released.
    ///
    /// Idempotent, and safe to call concurrently with an in-flight operation or a concurrent
    ///  failure - a close requested during either is resolved as a successful close. Must not
    ///  be awaited from inside the channel's own pump callbacks (it joins those tasks).
    pub async fn close(&self) {
        let mut state_rx = self.state_tx.subscribe();
        let _ = self.transition(ChannelState::Closed, Some("close requested"));

        let handles: Vec<JoinHandle<()>> = self.pump_handles.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        *self.transport.lock().unwrap() = None;

        while !state_rx.borrow_and_update().is_terminal() {
            if state_rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Tear the channel down because its byte stream can no longer be trusted (framing/decode
    ///  errors) or serviced (transport errors).
    pub(crate) fn fail(&self, reason: &str) {
        let _ = self.transition(ChannelState::Failed, Some(reason));
    }

    /// The single place where state changes happen. Returns whether the state actually changed;
    ///  a transition from a terminal state to another terminal state is a no-op (a cancellation
    ///  race, not an error), while an illegal transition between live states is rejected.
    fn transition(&self, to: ChannelState, reason: Option<&str>) -> anyhow::Result<bool> {
        let mut rejected_from = None;
        let changed = self.state_tx.send_if_modified(|state| {
            if *state == to || state.is_terminal() {
                return false;
            }
            if !state.is_legal_transition_to(to) {
                rejected_from = Some(*state);
                return false;
            }
            *state = to;
            true
        });

        if let Some(from) = rejected_from {
            warn!("channel {}: rejecting illegal state transition {:?} -> {:?}", self.role, from, to);
            bail!("illegal channel state transition {:?} -> {:?}", from, to);
        }

        if changed {
            debug!("channel {}: now {:?} ({})", self.role, to, reason.unwrap_or("-"));
            if to.is_terminal() {
                self.discard_write_queue();
                self.write_notify.notify_waiters();
            }
            let _ = self.events.send(ChannelEvent {
                role: self.role,
                state: to,
                reason: reason.map(str::to_string),
            });
        }
        Ok(changed)
    }

    fn discard_write_queue(&self) {
        let mut queue = self.write_queue.lock().unwrap();
        if !queue.entries.is_empty() {
            debug!("channel {}: discarding {} unsent bytes in {} queued writes",
                self.role, queue.queued_bytes, queue.entries.len());
        }
        queue.entries.clear();
        queue.queued_bytes = 0;
    }

    fn spawn_pumps(self: &Arc<Self>, transport: Arc<dyn TransportStream>) {
        let read_handle = {
            let channel = self.clone();
            let transport = transport.clone();
            tokio::spawn(async move { channel.read_loop(transport).await })
        };
        let write_handle = {
            let channel = self.clone();
            tokio::spawn(async move { channel.write_loop(transport).await })
        };
        self.pump_handles.lock().unwrap().extend([read_handle, write_handle]);
    }

    /// wait for the channel to become operational; false means it was torn down first
    async fn await_open(&self, state_rx: &mut watch::Receiver<ChannelState>) -> bool {
        loop {
            let state = *state_rx.borrow_and_update();
            match state {
                ChannelState::Open => return true,
                s if s.is_terminal() => return false,
                _ => {}
            }
            if state_rx.changed().await.is_err() {
                return false;
            }
        }
    }

    async fn read_loop(self: Arc<Self>, transport: Arc<dyn TransportStream>) {
        let mut state_rx = self.state_tx.subscribe();
        if !self.await_open(&mut state_rx).await {
            return;
        }
        let read_chunk_size = self.config.read_chunk_size;

        loop {
            if self.state().is_terminal() {
                break;
            }

            tokio::select! {
                result = transport.read_chunk(read_chunk_size) => {
                    match result {
                        Ok(chunk) if chunk.is_empty() => {
                            debug!("channel {}: end of stream", self.role);
                            let _ = self.transition(ChannelState::Closed, Some("end of stream"));
                            break;
                        }
                        Ok(chunk) => {
                            trace!("channel {}: read {} bytes", self.role, chunk.len());
                            if self.inbound_tx.send(chunk).is_err() {
                                // the inbound consumer detached - the bytes have nowhere to go
                                trace!("channel {}: no inbound consumer - discarding chunk", self.role);
                            }
                        }
                        Err(e) => {
                            error!("channel {}: transport read failed: {:#}", self.role, e);
                            let _ = self.transition(ChannelState::Failed, Some(&format!("transport read failed: {}", e)));
                            break;
                        }
                    }
                }
                _ = state_rx.changed() => {
                    // terminal state is re-checked at the top of the loop
                }
            }
        }
    }

    async fn write_loop(self: Arc<Self>, transport: Arc<dyn TransportStream>) {
        let mut state_rx = self.state_tx.subscribe();
        if !self.await_open(&mut state_rx).await {
            return;
        }

        loop {
            if self.state().is_terminal() {
                break;
            }

            //TODO vectored writes - small frames could share a single transport call
            // snapshot the front entry; the lock is never held across the transport call
            let front = {
                let queue = self.write_queue.lock().unwrap();
                queue.entries.front().map(|e| (e.buf.clone(), e.offset))
            };

            let (buf, offset) = match front {
                Some(front) => front,
                None => {
                    tokio::select! {
                        _ = self.write_notify.notified() => {}
                        _ = state_rx.changed() => {}
                    }
                    continue;
                }
            };

            let result = tokio::select! {
                result = transport.write_chunk(&buf[offset..]) => result,
                _ = state_rx.changed() => continue,
            };

            match result {
                Ok(0) => {
                    error!("channel {}: transport accepted no bytes", self.role);
                    let _ = self.transition(ChannelState::Failed, Some("transport accepted no bytes"));
                    break;
                }
                Ok(n) => {
                    let mut queue = self.write_queue.lock().unwrap();
                    // the queue may have been discarded concurrently by a teardown
                    if let Some(entry) = queue.entries.front_mut() {
                        entry.offset += n;
                        let buf_len = entry.buf.len();
                        let entry_offset = entry.offset;
                        queue.queued_bytes -= n;
                        if entry_offset == buf_len {
                            trace!("channel {}: flushed a queued write of {} bytes", self.role, buf_len);
                            queue.entries.pop_front();
                        }
                        else {
                            trace!("channel {}: partial write of {} bytes, {} remaining in front entry",
                                self.role, n, buf_len - entry_offset);
                        }
                    }
                }
                Err(e) => {
                    error!("channel {}: transport write failed: {:#}", self.role, e);
                    let _ = self.transition(ChannelState::Failed, Some(&format!("transport write failed: {}", e)));
                    break;
                }
            }
        }
        self.discard_write_queue();
    }
}
