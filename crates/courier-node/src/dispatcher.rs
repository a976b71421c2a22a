//! # Node / Dispatcher
//!
//! Wires the datagram I/O, the three reliability engines, and the
//! store into one running node. A reception thread decodes inbound
//! datagrams and routes them by message type; a tick thread drives
//! timeout checks, retransmission, custody retries, and periodic
//! cleanup; a dedicated send-worker thread owns the only path that
//! touches the socket for writes, fed by a bounded channel so a burst
//! of retransmissions can never block the reception thread.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use tracing::{debug, error, info, warn};

use courier_store::Store;
use courier_transport::custody::CustodyManager;
use courier_transport::receiver::ReceiveEngine;
use courier_transport::sender::SendEngine;
use courier_transport::wire::{self, Message};

use crate::config::CourierConfig;
use crate::net::datagram::DatagramIo;

const TIMEOUT_CHECK_INTERVAL: Duration = Duration::from_millis(50);
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
const OUTBOUND_QUEUE_CAPACITY: usize = 4096;

pub fn now_unix() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Raised when a datagram cannot be handed to the send worker.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("outbound queue is full")]
    Full,
    #[error("send worker has shut down")]
    Disconnected,
}

pub struct Node {
    config: CourierConfig,
    store: Arc<dyn Store>,
    send_engine: Arc<SendEngine>,
    receive_engine: Arc<ReceiveEngine>,
    custody: Arc<CustodyManager>,
    io: Arc<DatagramIo>,
    outbound_tx: Sender<(Bytes, SocketAddr)>,
    outbound_rx: Receiver<(Bytes, SocketAddr)>,
    /// Destination address registered for a bundle we are sending, so
    /// the tick thread knows where to aim retransmissions.
    destinations: Mutex<HashMap<String, SocketAddr>>,
    shutdown: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    pub fn new(config: CourierConfig, store: Arc<dyn Store>) -> anyhow::Result<Arc<Self>> {
        let io = Arc::new(DatagramIo::bind(config.port)?);
        let send_engine = Arc::new(SendEngine::new(store.clone(), config.send.clone()));
        let receive_engine = Arc::new(ReceiveEngine::new(
            store.clone(),
            config.node_id.clone(),
            config.receive.clone(),
        ));
        let custody = Arc::new(CustodyManager::new(
            store.clone(),
            config.node_id.clone(),
            config.custody.clone(),
        ));
        let (outbound_tx, outbound_rx) = crossbeam_channel::bounded(OUTBOUND_QUEUE_CAPACITY);

        send_engine.resume_transfers(now_unix())?;

        Ok(Arc::new(Node {
            config,
            store,
            send_engine,
            receive_engine,
            custody,
            io,
            outbound_tx,
            outbound_rx,
            destinations: Mutex::new(HashMap::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
            threads: Mutex::new(Vec::new()),
        }))
    }

    /// Spawns the reception, tick, and send-worker threads. Idempotent
    /// no-op if already started.
    pub fn start(self: &Arc<Self>) {
        let mut threads = self.threads.lock().unwrap();
        if !threads.is_empty() {
            return;
        }

        let send_node = self.clone();
        threads.push(
            thread::Builder::new()
                .name("courier-send".into())
                .spawn(move || send_node.send_worker())
                .expect("failed to spawn send worker thread"),
        );

        let recv_node = self.clone();
        threads.push(
            thread::Builder::new()
                .name("courier-recv".into())
                .spawn(move || recv_node.receive_loop())
                .expect("failed to spawn reception thread"),
        );

        let tick_node = self.clone();
        threads.push(
            thread::Builder::new()
                .name("courier-tick".into())
                .spawn(move || tick_node.tick_loop())
                .expect("failed to spawn tick thread"),
        );
    }

    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let mut threads = self.threads.lock().unwrap();
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
    }

    fn send_worker(self: Arc<Self>) {
        while !self.shutdown.load(Ordering::SeqCst) {
            match self.outbound_rx.recv_timeout(TIMEOUT_CHECK_INTERVAL) {
                Ok((datagram, dest)) => {
                    if let Err(err) = self.io.send_to(&datagram, dest) {
                        warn!(dest = %dest, error = %err, "datagram send failed");
                    }
                }
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    fn receive_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; wire::MAX_DATAGRAM];
        while !self.shutdown.load(Ordering::SeqCst) {
            match self.io.recv(&mut buf) {
                Ok(Some((n, src))) => {
                    if let Some(msg) = Message::decode(&buf[..n]) {
                        if let Err(err) = self.handle_message(msg, src) {
                            warn!(error = %err, "failed to handle inbound message");
                        }
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    error!(error = %err, "datagram receive failed");
                }
            }
        }
    }

    fn handle_message(&self, msg: Message, src: SocketAddr) -> anyhow::Result<()> {
        let now = now_unix();
        match msg {
            Message::Data(data) => {
                let outcome = self.receive_engine.handle_data(&data, &src.to_string(), now)?;
                if let Some(sack) = outcome.sack {
                    self.send_datagram(&Message::Sack(sack), src)?;
                }
                if let Some(bytes) = outcome.file_bytes {
                    self.write_received_file(&data.bundle_id, &bytes)?;
                    self.send_datagram(
                        &Message::Delivered(wire::DeliveredMsg {
                            bundle_id: data.bundle_id.clone(),
                        }),
                        src,
                    )?;
                    if let Some(ack) = outcome.custody_ack {
                        self.send_datagram(&Message::CustodyAck(ack), src)?;
                    }
                    info!(bundle_id = %data.bundle_id, bytes = bytes.len(), "bundle delivered");
                }
            }
            Message::Sack(sack) => {
                let (resends, _completed) = self.send_engine.handle_sack(&sack, now)?;
                self.send_data_batch(resends, src)?;
            }
            Message::CustodyReq(req) => {
                let ack = self.custody.handle_custody_req(
                    &req.bundle_id,
                    &src.to_string(),
                    req.ranges,
                    now,
                )?;
                self.send_datagram(&Message::CustodyAck(ack), src)?;
            }
            Message::CustodyAck(ack) => {
                self.custody.handle_custody_ack(&ack.bundle_id, ack.ack_nonce)?;
            }
            Message::Delivered(delivered) => {
                self.send_engine.handle_delivered(&delivered.bundle_id, now)?;
                self.custody.handle_delivered(&delivered.bundle_id)?;
            }
        }
        Ok(())
    }

    fn tick_loop(self: Arc<Self>) {
        let mut last_cleanup = now_unix();
        while !self.shutdown.load(Ordering::SeqCst) {
            thread::sleep(TIMEOUT_CHECK_INTERVAL);
            let now = now_unix();

            for bundle_id in self.send_engine.check_timeouts(now) {
                let dest = self.destinations.lock().unwrap().get(&bundle_id).copied();
                if let Some(dest) = dest {
                    let resends = self.send_engine.retransmit_chunks(&bundle_id, now);
                    if let Err(err) = self.send_data_batch(resends, dest) {
                        warn!(bundle_id, error = %err, "retransmit send failed");
                    }
                }
            }

            if let Err(err) = self.custody.check_retry_timers(now).and_then(|due| {
                for retry in due {
                    if let Some(dest) = self.destinations.lock().unwrap().get(&retry.bundle_id).copied() {
                        self.send_datagram(&Message::CustodyReq(retry.message), dest)?;
                    }
                }
                Ok(())
            }) {
                warn!(error = %err, "custody retry sweep failed");
            }

            if now - last_cleanup >= CLEANUP_INTERVAL.as_secs_f64() {
                self.send_engine.cleanup_completed_transfers();
                match self.store.cleanup_expired(now) {
                    Ok(removed) if !removed.is_empty() => {
                        debug!(count = removed.len(), "cleaned up expired bundles");
                    }
                    Err(err) => warn!(error = %err, "cleanup_expired failed"),
                    _ => {}
                }
                last_cleanup = now;
            }
        }
    }

    fn send_datagram(&self, msg: &Message, dest: SocketAddr) -> anyhow::Result<()> {
        let encoded = msg
            .encode()
            .ok_or_else(|| anyhow::anyhow!("message for bundle {} exceeds MAX_DATAGRAM", msg.bundle_id()))?;
        match self.outbound_tx.try_send((encoded, dest)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(DispatchError::Full.into()),
            Err(TrySendError::Disconnected(_)) => Err(DispatchError::Disconnected.into()),
        }
    }

    /// Sends a batch of `DATA` datagrams, sleeping
    /// `config.send.pacing_delay_ms` every 10 datagrams. Pacing lives
    /// here rather than in `SendEngine` so the engine's pure logic
    /// never blocks.
    fn send_data_batch(&self, msgs: Vec<wire::DataMsg>, dest: SocketAddr) -> anyhow::Result<()> {
        for (i, data) in msgs.into_iter().enumerate() {
            self.send_datagram(&Message::Data(data), dest)?;
            if self.config.send.pacing_delay_ms > 0 && (i + 1) % 10 == 0 {
                thread::sleep(Duration::from_millis(self.config.send.pacing_delay_ms));
            }
        }
        Ok(())
    }

    /// Writes a fully-reassembled bundle to `<output_dir>/bundle_<id>.bin`.
    fn write_received_file(&self, bundle_id: &str, bytes: &[u8]) -> anyhow::Result<()> {
        let dir = std::path::Path::new(&self.config.output_dir);
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("bundle_{bundle_id}.bin"));
        std::fs::write(&path, bytes)?;
        debug!(bundle_id, path = %path.display(), "received file written");
        Ok(())
    }

    pub fn send_file(&self, bundle_id: &str, dest: SocketAddr, data: &[u8]) -> anyhow::Result<()> {
        self.destinations.lock().unwrap().insert(bundle_id.to_string(), dest);
        let now = now_unix();
        let out = self.send_engine.start_transfer(
            bundle_id,
            &self.config.node_id,
            &dest.to_string(),
            data,
            self.config.fec,
            now,
        )?;
        self.send_data_batch(out, dest)
    }

    pub fn wait_for_completion(&self, bundle_id: &str, timeout: Duration) -> bool {
        let deadline = now_unix() + timeout.as_secs_f64();
        loop {
            if let Some(status) = self.send_engine.get_send_status(bundle_id) {
                if status.completed {
                    return true;
                }
            } else {
                return false;
            }
            if now_unix() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(100));
        }
    }

    pub fn send_status_json(&self, bundle_id: &str) -> Option<serde_json::Value> {
        self.send_engine
            .get_send_status(bundle_id)
            .map(|s| serde_json::to_value(s).unwrap())
    }

    pub fn receive_status_json(&self, bundle_id: &str) -> Option<serde_json::Value> {
        self.receive_engine
            .get_receive_status(bundle_id)
            .map(|s| serde_json::to_value(s).unwrap())
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.io.local_addr()
    }

    pub fn list_bundles(&self) -> anyhow::Result<Vec<courier_store::BundleRecord>> {
        Ok(self.store.list_bundles()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CourierConfig;
    use courier_store::SqliteStore;
    use std::sync::Arc;

    fn node_with_port(port: u16) -> Arc<Node> {
        let mut config = CourierConfig::defaults();
        config.port = port;
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        Node::new(config, store).unwrap()
    }

    #[test]
    fn send_and_receive_small_file_end_to_end() {
        let sender = node_with_port(0);
        let receiver = node_with_port(0);
        sender.start();
        receiver.start();

        let receiver_addr = receiver.local_addr().unwrap();
        let data = b"hello courier".to_vec();
        sender.send_file("bundle-e2e", receiver_addr, &data).unwrap();

        let completed = sender.wait_for_completion("bundle-e2e", Duration::from_secs(5));
        assert!(completed, "transfer should complete within timeout");

        sender.stop();
        receiver.stop();
    }
}
