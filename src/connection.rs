//! The aggregate of all channels belonging to one remote-desktop session. A connection owns a
//!  fixed, named set of channels appropriate to the negotiated configuration and folds their
//!  lifecycles into a single session state machine: it is `Connected` only while every required
//!  channel is open, and the first channel failure fails the whole session.
//!
//! Channel state changes arrive over an mpsc queue and are processed by a single aggregation
//!  task; application callbacks are invoked from that task, never from a channel's I/O pumps.

use crate::channel::{Channel, ChannelEvent, ChannelRole, ChannelState};
use crate::config::TransportConfig;
use crate::transport::TransportStream;
use anyhow::bail;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Initializing,
    Connecting,
    Connected,
    Closed,
    Failed,
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Failed)
    }

    fn is_legal_transition_to(self, to: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!((self, to), (Initializing, Connecting) | (Connecting, Connected))
            || (!self.is_terminal() && to.is_terminal())
    }
}

/// Which transport the negotiated configuration uses for video.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoTransport {
    /// no video channel (control and input only)
    None,
    /// legacy single reliable stream
    Stream,
    /// RTP + RTCP over unreliable transports
    Rtp,
}

/// The negotiated shape of a session; fixed once the connection is created.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub video: VideoTransport,
}

impl SessionConfig {
    pub fn required_roles(&self) -> Vec<ChannelRole> {
        let mut result = vec![ChannelRole::Control, ChannelRole::Event];
        match self.video {
            VideoTransport::None => {}
            VideoTransport::Stream => result.push(ChannelRole::Video),
            VideoTransport::Rtp => {
                result.push(ChannelRole::VideoRtp);
                result.push(ChannelRole::VideoRtcp);
            }
        }
        result
    }
}

/// Session-state notifications for the application layer. Each terminal notification fires
///  exactly once, after every channel has reached a terminal state; the reason accompanying
///  `Failed` is opaque to this layer.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SessionEventListener: Send + Sync + 'static {
    async fn on_state_change(&self, state: ConnectionState, reason: Option<String>);
}

struct ConnectionInner {
    peer_jid: String,
    required_roles: Vec<ChannelRole>,
    channels: FxHashMap<ChannelRole, Arc<Channel>>,
    state_tx: watch::Sender<ConnectionState>,
    listener: Arc<dyn SessionEventListener>,
}

impl ConnectionInner {
    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Mirrors the per-channel transition discipline: terminal-to-terminal is a cancellation
    ///  race resolved as a no-op, an illegal transition between live states is rejected, and
    ///  the return value says whether this caller performed the change (and therefore owns the
    ///  resulting notification).
    fn transition(&self, to: ConnectionState) -> anyhow::Result<bool> {
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
            warn!("connection to {}: rejecting illegal state transition {:?} -> {:?}", self.peer_jid, from, to);
            bail!("illegal connection state transition {:?} -> {:?}", from, to);
        }
        if changed {
            debug!("connection to {}: now {:?}", self.peer_jid, to);
        }
        Ok(changed)
    }

    async fn close_all_channels(&self) {
        for channel in self.channels.values() {
            channel.close().await;
        }
    }

    fn all_required_channels_open(&self) -> bool {
        self.required_roles.iter()
            .all(|role| self.channels[role].state() == ChannelState::Open)
    }
}

pub struct Connection {
    inner: Arc<ConnectionInner>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ChannelEvent>>>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(handle) = self.loop_handle.lock().unwrap().take() {
            handle.abort();
        }
    }
}

impl Connection {
    pub fn new(
        peer_jid: impl Into<String>,
        session_config: SessionConfig,
        transport_config: Arc<TransportConfig>,
        listener: Arc<dyn SessionEventListener>,
    ) -> anyhow::Result<Connection> {
        transport_config.validate()?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let required_roles = session_config.required_roles();

        let mut channels = FxHashMap::default();
        for &role in &required_roles {
            channels.insert(role, Channel::new(role, transport_config.clone(), events_tx.clone()));
        }

        let (state_tx, _) = watch::channel(ConnectionState::Initializing);

        Ok(Connection {
            inner: Arc::new(ConnectionInner {
                peer_jid: peer_jid.into(),
                required_roles,
                channels,
                state_tx,
                listener,
            }),
            events_rx: Mutex::new(Some(events_rx)),
            loop_handle: Mutex::new(None),
        })
    }

    pub fn peer_jid(&self) -> &str {
        &self.inner.peer_jid
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn channel(&self, role: ChannelRole) -> Option<Arc<Channel>> {
        self.inner.channels.get(&role).cloned()
    }

    /// Start the session handshake: from here on, transports are attached as the signaling
    ///  layer establishes them, and the connection reports `Connected` once the last required
    ///  channel is open.
    pub async fn connect(&self) -> anyhow::Result<()> {
        let events_rx = match self.events_rx.lock().unwrap().take() {
            Some(events_rx) => events_rx,
            None => bail!("connect may only be called once"),
        };

        if !self.inner.transition(ConnectionState::Connecting)? {
            bail!("connection to {} is already {:?}", self.inner.peer_jid, self.state());
        }
        info!("connection to {}: waiting for {} channels", self.inner.peer_jid, self.inner.required_roles.len());

        let handle = tokio::spawn(Self::run_aggregation_loop(self.inner.clone(), events_rx));
        *self.loop_handle.lock().unwrap() = Some(handle);

        self.inner.listener.on_state_change(ConnectionState::Connecting, None).await;
        Ok(())
    }

    /// Hand an established transport stream to the channel with the given role. Channels come
    ///  up independently, in whatever order the signaling layer delivers their streams.
    pub fn attach_transport(&self, role: ChannelRole, transport: Arc<dyn TransportStream>) -> anyhow::Result<()> {
        if self.state() == ConnectionState::Initializing {
            bail!("transports can only be attached after connect()");
        }

        let channel = match self.inner.channels.get(&role) {
            Some(channel) => channel,
            None => bail!("the negotiated configuration has no {} channel", role),
        };
        channel.connect(transport)
    }

    /// Close the session. Safe to call while connecting (aborts the in-flight handshake) or
    ///  connected (graceful shutdown); idempotent, also under concurrent invocation. The
    ///  listener sees exactly one terminal notification, after every channel has reached a
    ///  terminal state.
    pub async fn close(&self) {
        let changed = self.inner.transition(ConnectionState::Closed).unwrap_or(false);

        if changed {
            // this caller owns the teardown
            if let Some(handle) = self.loop_handle.lock().unwrap().take() {
                handle.abort();
            }
            self.inner.close_all_channels().await;
            info!("connection to {}: closed", self.inner.peer_jid);
            self.inner.listener.on_state_change(ConnectionState::Closed, None).await;
        }
        else {
            // somebody else is (or was) tearing the session down - just make sure the channels
            //  are really gone before returning
            self.inner.close_all_channels().await;
        }
    }

    async fn run_aggregation_loop(inner: Arc<ConnectionInner>, mut events: mpsc::UnboundedReceiver<ChannelEvent>) {
        while let Some(event) = events.recv().await {
            trace!("connection to {}: channel {} is now {:?}", inner.peer_jid, event.role, event.state);

            match event.state {
                ChannelState::Open => {
                    if inner.all_required_channels_open() {
                        if inner.transition(ConnectionState::Connected).unwrap_or(false) {
                            info!("connection to {}: all channels open", inner.peer_jid);
                            inner.listener.on_state_change(ConnectionState::Connected, None).await;
                        }
                    }
                }
                ChannelState::Failed => {
                    let reason = event.reason
                        .unwrap_or_else(|| format!("{} channel failed", event.role));
                    if inner.transition(ConnectionState::Failed).unwrap_or(false) {
                        inner.close_all_channels().await;
                        inner.listener.on_state_change(ConnectionState::Failed, Some(reason)).await;
                        break;
                    }
                }
                ChannelState::Closed => {
                    // a peer-initiated teardown of any required channel ends the session; a
                    //  locally requested close has already moved the connection to a terminal
                    //  state, making this a no-op
                    if inner.transition(ConnectionState::Closed).unwrap_or(false) {
                        inner.close_all_channels().await;
                        inner.listener.on_state_change(ConnectionState::Closed, event.reason).await;
                        break;
                    }
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{wait_until, ScriptedTransport};
    use std::time::Duration;

    struct RecordingListener {
        notifications: Mutex<Vec<(ConnectionState, Option<String>)>>,
    }
    impl RecordingListener {
        fn new() -> Arc<RecordingListener> {
            Arc::new(RecordingListener { notifications: Mutex::new(Vec::new()) })
        }
        fn states(&self) -> Vec<ConnectionState> {
            self.notifications.lock().unwrap().iter().map(|(s, _)| *s).collect()
        }
        fn count_of(&self, state: ConnectionState) -> usize {
            self.states().into_iter().filter(|s| *s == state).count()
        }
    }
    #[async_trait]
    impl SessionEventListener for RecordingListener {
        async fn on_state_change(&self, state: ConnectionState, reason: Option<String>) {
            self.notifications.lock().unwrap().push((state, reason));
        }
    }

    fn new_connection(listener: Arc<RecordingListener>) -> Connection {
        Connection::new(
            "user@example.com/remote42",
            SessionConfig { video: VideoTransport::Stream },
            Arc::new(TransportConfig::default()),
            listener,
        ).unwrap()
    }

    #[tokio::test]
    async fn test_connected_only_after_the_last_required_channel_opens() {
        let listener = RecordingListener::new();
        let connection = new_connection(listener.clone());
        connection.connect().await.unwrap();

        let (t1, _i1) = ScriptedTransport::new(usize::MAX);
        let (t2, _i2) = ScriptedTransport::new(usize::MAX);
        let (t3, _i3) = ScriptedTransport::new(usize::MAX);

        connection.attach_transport(ChannelRole::Control, t1).unwrap();
        connection.attach_transport(ChannelRole::Event, t2).unwrap();
        // two of three channels open - the connection must not report Connected
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(connection.state(), ConnectionState::Connecting);
        assert_eq!(listener.count_of(ConnectionState::Connected), 0);

        connection.attach_transport(ChannelRole::Video, t3).unwrap();
        wait_until(|| connection.state() == ConnectionState::Connected).await;
        assert_eq!(listener.count_of(ConnectionState::Connected), 1);

        connection.close().await;
    }

    #[tokio::test]
    async fn test_channel_failure_fails_the_connection_exactly_once_and_closes_the_rest() {
        let listener = RecordingListener::new();
        let connection = new_connection(listener.clone());
        connection.connect().await.unwrap();

        let (t1, _i1) = ScriptedTransport::new(usize::MAX);
        let (t2, i2) = ScriptedTransport::new(usize::MAX);
        let (t3, _i3) = ScriptedTransport::new(usize::MAX);
        connection.attach_transport(ChannelRole::Control, t1).unwrap();
        connection.attach_transport(ChannelRole::Event, t2).unwrap();
        connection.attach_transport(ChannelRole::Video, t3).unwrap();
        wait_until(|| connection.state() == ConnectionState::Connected).await;

        i2.send(Err(anyhow::anyhow!("connection reset by peer"))).unwrap();

        wait_until(|| connection.state() == ConnectionState::Failed).await;
        wait_until(|| listener.count_of(ConnectionState::Failed) == 1).await;

        for role in [ChannelRole::Control, ChannelRole::Event, ChannelRole::Video] {
            let channel = connection.channel(role).unwrap();
            wait_until(move || channel.state().is_terminal()).await;
        }

        // the failure reason is carried through, opaque as it is
        let notifications = listener.notifications.lock().unwrap();
        let (_, reason) = notifications.iter().find(|(s, _)| *s == ConnectionState::Failed).unwrap();
        assert!(reason.as_ref().unwrap().contains("connection reset by peer"));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_notifies_once() {
        let listener = RecordingListener::new();
        let connection = new_connection(listener.clone());
        connection.connect().await.unwrap();

        let (t1, _i1) = ScriptedTransport::new(usize::MAX);
        let (t2, _i2) = ScriptedTransport::new(usize::MAX);
        let (t3, _i3) = ScriptedTransport::new(usize::MAX);
        connection.attach_transport(ChannelRole::Control, t1).unwrap();
        connection.attach_transport(ChannelRole::Event, t2).unwrap();
        connection.attach_transport(ChannelRole::Video, t3).unwrap();
        wait_until(|| connection.state() == ConnectionState::Connected).await;

        connection.close().await;
        connection.close().await;

        assert_eq!(connection.state(), ConnectionState::Closed);
        assert_eq!(listener.count_of(ConnectionState::Closed), 1);
        for role in [ChannelRole::Control, ChannelRole::Event, ChannelRole::Video] {
            assert!(connection.channel(role).unwrap().state().is_terminal());
        }
    }

    #[tokio::test]
    async fn test_close_while_connecting_aborts_the_handshake() {
        let listener = RecordingListener::new();
        let connection = new_connection(listener.clone());
        connection.connect().await.unwrap();

        let (t1, _i1) = ScriptedTransport::new(usize::MAX);
        connection.attach_transport(ChannelRole::Control, t1).unwrap();

        connection.close().await;

        assert_eq!(connection.state(), ConnectionState::Closed);
        assert_eq!(listener.count_of(ConnectionState::Closed), 1);
        assert_eq!(listener.count_of(ConnectionState::Connected), 0);
    }

    #[tokio::test]
    async fn test_attach_before_connect_is_rejected() {
        let listener = RecordingListener::new();
        let connection = new_connection(listener);

        let (t1, _i1) = ScriptedTransport::new(usize::MAX);
        assert!(connection.attach_transport(ChannelRole::Control, t1).is_err());
    }

    #[tokio::test]
    async fn test_attach_for_role_outside_the_negotiated_config_is_rejected() {
        let listener = RecordingListener::new();
        let connection = Connection::new(
            "user@example.com/remote42",
            SessionConfig { video: VideoTransport::None },
            Arc::new(TransportConfig::default()),
            listener,
        ).unwrap();
        connection.connect().await.unwrap();

        let (t1, _i1) = ScriptedTransport::new(usize::MAX);
        assert!(connection.attach_transport(ChannelRole::VideoRtp, t1).is_err());

        connection.close().await;
    }

    #[tokio::test]
    async fn test_connect_twice_is_rejected() {
        let listener = RecordingListener::new();
        let connection = new_connection(listener);

        connection.connect().await.unwrap();
        assert!(connection.connect().await.is_err());

        connection.close().await;
    }

    #[tokio::test]
    async fn test_peer_initiated_channel_close_closes_the_session() {
        let listener = RecordingListener::new();
        let connection = new_connection(listener.clone());
        connection.connect().await.unwrap();

        let (t1, i1) = ScriptedTransport::new(usize::MAX);
        let (t2, _i2) = ScriptedTransport::new(usize::MAX);
        let (t3, _i3) = ScriptedTransport::new(usize::MAX);
        connection.attach_transport(ChannelRole::Control, t1).unwrap();
        connection.attach_transport(ChannelRole::Event, t2).unwrap();
        connection.attach_transport(ChannelRole::Video, t3).unwrap();
        wait_until(|| connection.state() == ConnectionState::Connected).await;

        drop(i1); // end of stream on the control channel

        wait_until(|| connection.state() == ConnectionState::Closed).await;
        assert_eq!(listener.count_of(ConnectionState::Closed), 1);
    }
}
