//! Shared test doubles for the async parts of the crate.

use crate::transport::TransportStream;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};

/// A scriptable [`TransportStream`]: inbound chunks (or errors) are injected through an mpsc
///  sender, written bytes are recorded, and writes can be gated behind a semaphore so tests
///  control exactly how many queued buffers get flushed. Dropping the inbound sender reads as
///  end of stream.
pub struct ScriptedTransport {
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<anyhow::Result<Bytes>>>,
    written: Mutex<Vec<u8>>,
    /// cap on the bytes accepted per write call, to provoke partial writes
    max_write: usize,
    write_gate: Option<Semaphore>,
}

impl ScriptedTransport {
    pub fn new(max_write: usize) -> (Arc<ScriptedTransport>, mpsc::UnboundedSender<anyhow::Result<Bytes>>) {
        Self::create(max_write, None)
    }

    /// Writes block until [`release_writes`](Self::release_writes) grants them.
    pub fn gated(max_write: usize) -> (Arc<ScriptedTransport>, mpsc::UnboundedSender<anyhow::Result<Bytes>>) {
        Self::create(max_write, Some(Semaphore::new(0)))
    }

    fn create(max_write: usize, write_gate: Option<Semaphore>) -> (Arc<ScriptedTransport>, mpsc::UnboundedSender<anyhow::Result<Bytes>>) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(ScriptedTransport {
            inbound: tokio::sync::Mutex::new(inbound_rx),
            written: Mutex::new(Vec::new()),
            max_write,
            write_gate,
        });
        (transport, inbound_tx)
    }

    pub fn release_writes(&self, count: usize) {
        self.write_gate.as_ref()
            .expect("transport was not created with gated writes")
            .add_permits(count);
    }

    pub fn written(&self) -> Vec<u8> {
        self.written.lock().unwrap().clone()
    }
}

#[async_trait]
impl TransportStream for ScriptedTransport {
    async fn read_chunk(&self, _max_len: usize) -> anyhow::Result<Bytes> {
        // scripted chunks are small, the max_len bound is not enforced
        match self.inbound.lock().await.recv().await {
            Some(Ok(chunk)) => Ok(chunk),
            Some(Err(e)) => Err(e),
            None => Ok(Bytes::new()),
        }
    }

    async fn write_chunk(&self, buf: &[u8]) -> anyhow::Result<usize> {
        if let Some(gate) = &self.write_gate {
            gate.acquire().await?.forget();
        }
        let n = buf.len().min(self.max_write);
        self.written.lock().unwrap().extend_from_slice(&buf[..n]);
        Ok(n)
    }
}

/// Poll `condition` until it holds, panicking after a generous timeout. For asserting on state
///  that a spawned pump updates asynchronously.
pub async fn wait_until(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached within timeout");
}
