//! Periodic signed liveness messages, independent of the session's channels. The sender proves
//!  to the directory that this endpoint is still alive and authorized, and the directory can
//!  re-tune how often it wants to hear from us.

use crate::config::HeartbeatConfig;
use anyhow::bail;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, trace, warn};

/// One liveness stanza: the sender's declared identity, the time of sending, and a signature
///  over `identity + " " + timestamp` proving possession of the host key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatStanza {
    pub host_id: String,
    pub timestamp_millis: u64,
    pub signature: Vec<u8>,
}

/// The well-formed response to a heartbeat. The peer may direct a new interval, which takes
///  effect for the *next* tick, never retroactively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatResponse {
    pub set_interval_millis: Option<u64>,
}

/// Computes the liveness signature from the locally held host key.
///
/// The signed text is `identity + " " + decimal timestamp`, digested together with the key.
///  The scheme is deliberately isolated here - a deployment with an asymmetric verifier swaps
///  this type and nothing else.
pub struct HeartbeatSigner {
    key: Vec<u8>,
}

impl HeartbeatSigner {
    pub fn new(key: Vec<u8>) -> HeartbeatSigner {
        HeartbeatSigner { key }
    }

    pub fn sign(&self, host_id: &str, timestamp_millis: u64) -> Vec<u8> {
        let mut sha256 = Sha256::default();
        sha256.update(&self.key);
        sha256.update(host_id.as_bytes());
        sha256.update(b" ");
        sha256.update(timestamp_millis.to_string().as_bytes());
        sha256.finalize().to_vec()
    }
}

/// The request/response channel heartbeats travel over (in the original system, a signaling
///  stanza exchange). Mocked in tests.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HeartbeatTransport: Send + Sync + 'static {
    async fn send_heartbeat(&self, stanza: HeartbeatStanza) -> anyhow::Result<HeartbeatResponse>;
}

struct HeartbeatState {
    interval: Duration,
    last_sent_millis: Option<u64>,
}

pub struct HeartbeatSender {
    host_id: String,
    signer: HeartbeatSigner,
    transport: Arc<dyn HeartbeatTransport>,
    config: HeartbeatConfig,

    state: Arc<Mutex<HeartbeatState>>,
    stop_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for HeartbeatSender {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.lock().unwrap().take() {
            handle.abort();
        }
    }
}

impl HeartbeatSender {
    pub fn new(
        host_id: impl Into<String>,
        signer: HeartbeatSigner,
        transport: Arc<dyn HeartbeatTransport>,
        config: HeartbeatConfig,
    ) -> HeartbeatSender {
        let (stop_tx, _) = watch::channel(false);
        HeartbeatSender {
            host_id: host_id.into(),
            signer,
            transport,
            state: Arc::new(Mutex::new(HeartbeatState {
                interval: config.initial_interval,
                last_sent_millis: None,
            })),
            config,
            stop_tx,
            handle: Mutex::new(None),
        }
    }

    /// Start the repeating timer. The first stanza goes out one interval from now.
    pub fn start(&self) {
        let mut handle = self.handle.lock().unwrap();
        if handle.is_some() || *self.stop_tx.borrow() {
            warn!("heartbeat sender already started or stopped");
            return;
        }

        let host_id = self.host_id.clone();
        let signature_key = self.signer.key.clone();
        let transport = self.transport.clone();
        let min_interval = self.config.min_interval;
        let state = self.state.clone();
        let mut stop_rx = self.stop_tx.subscribe();

        *handle = Some(tokio::spawn(async move {
            let signer = HeartbeatSigner::new(signature_key);
            loop {
                let interval = state.lock().unwrap().interval;
                tokio::select! {
                    _ = sleep(interval) => {}
                    _ = stop_rx.changed() => {}
                }
                if *stop_rx.borrow() {
                    debug!("heartbeat sender stopped");
                    break;
                }

                Self::do_send_heartbeat(&host_id, &signer, transport.as_ref(), &state, min_interval).await;
            }
        }));
    }

    /// Guarantee that no further stanza goes out, even if a tick is already scheduled.
    ///  Idempotent, and safe to call from anywhere - including the transport callback of an
    ///  in-flight tick (it only flips a flag, it never joins the timer task).
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    /// The interval currently in effect (the initial one, or the latest peer directive).
    pub fn current_interval(&self) -> Duration {
        self.state.lock().unwrap().interval
    }

    pub fn last_sent_millis(&self) -> Option<u64> {
        self.state.lock().unwrap().last_sent_millis
    }

    async fn do_send_heartbeat(
        host_id: &str,
        signer: &HeartbeatSigner,
        transport: &dyn HeartbeatTransport,
        state: &Mutex<HeartbeatState>,
        min_interval: Duration,
    ) {
        let timestamp_millis = match Self::timestamp_millis_now() {
            Ok(millis) => millis,
            Err(e) => {
                error!("cannot timestamp heartbeat: {:#} - skipping this tick", e);
                return;
            }
        };

        let stanza = HeartbeatStanza {
            host_id: host_id.to_string(),
            timestamp_millis,
            signature: signer.sign(host_id, timestamp_millis),
        };
        trace!("sending heartbeat for {} at {}", host_id, timestamp_millis);
        state.lock().unwrap().last_sent_millis = Some(timestamp_millis);

        match transport.send_heartbeat(stanza).await {
            Ok(response) => {
                if let Some(millis) = response.set_interval_millis {
                    let directed = Duration::from_millis(millis);
                    let effective = if directed < min_interval {
                        warn!("peer directed a heartbeat interval of {:?}, below the minimum of {:?} - clamping", directed, min_interval);
                        min_interval
                    }
                    else {
                        directed
                    };
                    debug!("heartbeat interval is now {:?}", effective);
                    state.lock().unwrap().interval = effective;
                }
            }
            Err(e) => {
                // no retry at this layer - the next tick is the retry
                warn!("heartbeat delivery failed: {:#}", e);
            }
        }
    }

    fn timestamp_millis_now() -> anyhow::Result<u64> {
        let raw = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)?
            .as_millis();
        if raw > u64::MAX as u128 {
            bail!("system clock is implausibly far in the future");
        }
        Ok(raw as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn new_sender(transport: Arc<dyn HeartbeatTransport>, initial: Duration, min: Duration) -> HeartbeatSender {
        HeartbeatSender::new(
            "host@example.com/remote42",
            HeartbeatSigner::new(b"host key".to_vec()),
            transport,
            HeartbeatConfig {
                initial_interval: initial,
                min_interval: min,
            },
        )
    }

    #[test]
    fn test_signature_covers_identity_and_timestamp() {
        let signer = HeartbeatSigner::new(b"host key".to_vec());

        let signature = signer.sign("host@example.com", 1234);
        assert_eq!(signature.len(), 32);
        // deterministic for identical inputs
        assert_eq!(signature, signer.sign("host@example.com", 1234));
        // any changed input changes the signature
        assert_ne!(signature, signer.sign("host@example.com", 1235));
        assert_ne!(signature, signer.sign("other@example.com", 1234));
        assert_ne!(signature, HeartbeatSigner::new(b"other key".to_vec()).sign("host@example.com", 1234));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_fire_at_the_configured_interval() {
        let sent = Arc::new(AtomicUsize::new(0));

        let mut transport = MockHeartbeatTransport::new();
        {
            let sent = sent.clone();
            transport.expect_send_heartbeat()
                .returning(move |stanza| {
                    assert_eq!(stanza.host_id, "host@example.com/remote42");
                    assert!(!stanza.signature.is_empty());
                    sent.fetch_add(1, Ordering::SeqCst);
                    Ok(HeartbeatResponse { set_interval_millis: None })
                });
        }

        let sender = new_sender(Arc::new(transport), Duration::from_secs(60), Duration::from_secs(1));
        sender.start();

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(sent.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(sent.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(sent.load(Ordering::SeqCst), 2);

        sender.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_directive_applies_to_the_next_tick() {
        let sent = Arc::new(AtomicUsize::new(0));

        let mut transport = MockHeartbeatTransport::new();
        {
            let sent = sent.clone();
            transport.expect_send_heartbeat()
                .returning(move |_| {
                    sent.fetch_add(1, Ordering::SeqCst);
                    // the peer wants to hear from us every 10 seconds instead
                    Ok(HeartbeatResponse { set_interval_millis: Some(10_000) })
                });
        }

        let sender = new_sender(Arc::new(transport), Duration::from_secs(60), Duration::from_secs(1));
        sender.start();

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(sent.load(Ordering::SeqCst), 1);
        assert_eq!(sender.current_interval(), Duration::from_secs(10));

        // the next tick honors the directive: after 10 seconds, not 60
        tokio::time::sleep(Duration::from_secs(8)).await;
        assert_eq!(sent.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(sent.load(Ordering::SeqCst), 2);

        sender.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_directed_interval_is_clamped_to_the_minimum() {
        let mut transport = MockHeartbeatTransport::new();
        transport.expect_send_heartbeat()
            .returning(|_| Ok(HeartbeatResponse { set_interval_millis: Some(1) }));

        let sender = new_sender(Arc::new(transport), Duration::from_secs(5), Duration::from_secs(2));
        sender.start();

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(sender.current_interval(), Duration::from_secs(2));

        sender.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_prevents_the_scheduled_tick() {
        let sent = Arc::new(AtomicUsize::new(0));

        let mut transport = MockHeartbeatTransport::new();
        {
            let sent = sent.clone();
            transport.expect_send_heartbeat()
                .returning(move |_| {
                    sent.fetch_add(1, Ordering::SeqCst);
                    Ok(HeartbeatResponse { set_interval_millis: None })
                });
        }

        let sender = new_sender(Arc::new(transport), Duration::from_secs(60), Duration::from_secs(1));
        sender.start();

        tokio::time::sleep(Duration::from_secs(30)).await;
        sender.stop();
        sender.stop(); // idempotent

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(sent.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivery_failure_does_not_stop_the_timer() {
        let attempts = Arc::new(AtomicUsize::new(0));

        let mut transport = MockHeartbeatTransport::new();
        {
            let attempts = attempts.clone();
            transport.expect_send_heartbeat()
                .returning(move |_| {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(anyhow::anyhow!("directory unreachable"))
                });
        }

        let sender = new_sender(Arc::new(transport), Duration::from_secs(10), Duration::from_secs(1));
        sender.start();

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(sender.last_sent_millis().is_some());

        sender.stop();
    }
}
