//! # Send Engine
//!
//! Pure logic plus the durable [`Store`] — no socket I/O. Splits a
//! bundle into chunks, generates FEC parity, drives the sliding send
//! window, and turns inbound `SACK`s into RTO updates and window
//! advancement. The datagram I/O layer owns the socket; this engine
//! only produces [`wire::DataMsg`]s for it to send and tells it when a
//! chunk's retransmission timer has fired.
//!
//! RTO estimation follows RFC 6298 (SRTT/RTTVAR with alpha=0.125,
//! beta=0.25), and excludes retransmitted chunks from RTT sampling
//! (Karn's rule) — a retransmitted chunk's ACK cannot be attributed to
//! either the original or the retransmitted send.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, info, warn};

use courier_store::{BundleRecord, BundleState, ChunkRecord, Store};

use crate::fec::generate_parity;
use crate::wire::{self, DataMsg, SackMsg};

#[derive(Debug, Clone)]
pub struct SendConfig {
    pub chunk_size: usize,
    pub window_size: u32,
    pub base_rto_ms: f64,
    pub ttl_sec: u64,
    pub max_rto_ms: f64,
    pub pacing_delay_ms: u64,
}

impl Default for SendConfig {
    fn default() -> Self {
        SendConfig {
            chunk_size: 1150,
            window_size: 1024,
            base_rto_ms: 900.0,
            ttl_sec: 300,
            max_rto_ms: 500.0,
            pacing_delay_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FecConfig {
    pub enabled: bool,
    pub k: u16,
    pub r: u16,
}

impl Default for FecConfig {
    fn default() -> Self {
        FecConfig {
            enabled: true,
            k: 4,
            r: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SendStatus {
    pub bundle_id: String,
    pub total_chunks: u32,
    pub acked_chunks: u32,
    pub progress: f64,
    pub bytes_sent: u64,
    pub chunks_retransmitted: u64,
    pub completed: bool,
    pub window_start: u32,
    pub window_end: u32,
    pub timeout_interval_ms: f64,
    pub smoothed_rtt_ms: Option<f64>,
}

struct SendState {
    dest: String,
    total_chunks: u32,
    window_start: u32,
    window_end: u32,
    chunk_timers: HashMap<u32, f64>,
    send_timestamps: HashMap<u32, f64>,
    retransmitted_chunks: HashSet<u32>,
    acked: BTreeSet<u32>,
    retransmit_queue: VecDeque<u32>,
    timeout_interval_ms: f64,
    srtt_ms: Option<f64>,
    rttvar_ms: Option<f64>,
    completed: bool,
    bytes_sent: u64,
    chunks_retransmitted: u64,
    /// chunk_id -> (block_id, k, r, checksum, payload). Dropped once the
    /// transfer completes.
    chunk_cache: HashMap<u32, (u32, u16, u16, u32, Bytes)>,
}

impl SendState {
    fn initial_window_end(&self, window_size: u32) -> u32 {
        window_size.min(self.total_chunks)
    }
}

pub struct SendEngine {
    store: Arc<dyn Store>,
    config: SendConfig,
    states: Mutex<HashMap<String, SendState>>,
}

impl SendEngine {
    pub fn new(store: Arc<dyn Store>, config: SendConfig) -> Self {
        SendEngine {
            store,
            config,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Splits `data` into chunks, generates FEC parity if enabled,
    /// persists the bundle and every chunk, and returns the initial
    /// window of `DATA` datagrams to send.
    pub fn start_transfer(
        &self,
        bundle_id: &str,
        src: &str,
        dst: &str,
        data: &[u8],
        fec: FecConfig,
        now: f64,
    ) -> anyhow::Result<Vec<DataMsg>> {
        let (chunks, num_data_chunks) = create_chunks(data, self.config.chunk_size, fec);
        let total_chunks = chunks.len() as u32;

        self.store.save_bundle(&BundleRecord {
            bundle_id: bundle_id.to_string(),
            src: src.to_string(),
            dst: dst.to_string(),
            ttl: self.config.ttl_sec,
            state: BundleState::Sending.as_str().to_string(),
            total_chunks,
            bytes_sent: 0,
            chunks_retransmitted: 0,
            fec_enabled: fec.enabled,
            k: fec.k,
            r: fec.r,
            created_at: now.to_string(),
            file_path: String::new(),
            file_size: data.len() as u64,
        })?;

        let records: Vec<ChunkRecord> = chunks
            .iter()
            .map(|c| ChunkRecord {
                bundle_id: bundle_id.to_string(),
                chunk_id: c.chunk_id,
                is_parity: c.chunk_id >= num_data_chunks,
                block_id: c.block_id,
                k: c.k,
                r: c.r,
                payload: c.payload.to_vec(),
                checksum: c.checksum,
                flags: 0,
            })
            .collect();
        self.store.save_chunks_bulk(&records)?;

        let mut chunk_cache = HashMap::new();
        for c in &chunks {
            chunk_cache.insert(c.chunk_id, (c.block_id, c.k, c.r, c.checksum, c.payload.clone()));
        }

        let mut state = SendState {
            dest: dst.to_string(),
            total_chunks,
            window_start: 0,
            window_end: 0,
            chunk_timers: HashMap::new(),
            send_timestamps: HashMap::new(),
            retransmitted_chunks: HashSet::new(),
            acked: BTreeSet::new(),
            retransmit_queue: VecDeque::new(),
            timeout_interval_ms: self.config.base_rto_ms,
            srtt_ms: None,
            rttvar_ms: None,
            completed: total_chunks == 0,
            bytes_sent: 0,
            chunks_retransmitted: 0,
            chunk_cache,
        };
        state.window_end = state.initial_window_end(self.config.window_size);

        let out = self.arm_window(bundle_id, &mut state, now);

        self.states.lock().unwrap().insert(bundle_id.to_string(), state);
        Ok(out)
    }

    fn arm_window(&self, bundle_id: &str, state: &mut SendState, now: f64) -> Vec<DataMsg> {
        let mut out = Vec::new();
        for chunk_id in state.window_start..state.window_end {
            if state.acked.contains(&chunk_id) || state.chunk_timers.contains_key(&chunk_id) {
                continue;
            }
            if let Some(msg) = self.build_data_msg(bundle_id, state, chunk_id) {
                state.chunk_timers.insert(chunk_id, now + state.timeout_interval_ms / 1000.0);
                state.send_timestamps.insert(chunk_id, now);
                state.bytes_sent += msg.payload.len() as u64;
                out.push(msg);
            }
        }
        out
    }

    fn build_data_msg(&self, bundle_id: &str, state: &SendState, chunk_id: u32) -> Option<DataMsg> {
        let (block_id, k, r, checksum, payload) = state.chunk_cache.get(&chunk_id)?.clone();
        Some(DataMsg {
            bundle_id: bundle_id.to_string(),
            chunk_id,
            total_chunks: state.total_chunks,
            block_id,
            k,
            r,
            checksum,
            flags: 0,
            payload,
        })
    }

    /// Processes an inbound `SACK`: updates RTT estimates for
    /// non-retransmitted chunks, clears timers for newly-acked chunks,
    /// advances the window, and returns any newly-armed `DATA`
    /// datagrams to send.
    pub fn handle_sack(&self, sack: &SackMsg, now: f64) -> anyhow::Result<(Vec<DataMsg>, bool)> {
        let mut states = self.states.lock().unwrap();
        let Some(state) = states.get_mut(&sack.bundle_id) else {
            return Ok((Vec::new(), false));
        };
        if state.completed {
            return Ok((Vec::new(), true));
        }

        let newly_acked: Vec<u32> = sack
            .acked_chunk_ids()
            .into_iter()
            .filter(|c| !state.acked.contains(c))
            .collect();

        for chunk_id in &newly_acked {
            state.acked.insert(*chunk_id);
            if !state.retransmitted_chunks.contains(chunk_id) {
                if let Some(sent_at) = state.send_timestamps.get(chunk_id) {
                    let rtt_ms = (now - sent_at) * 1000.0;
                    update_rtt_estimates(state, rtt_ms, self.config.max_rto_ms);
                }
            }
            state.chunk_timers.remove(chunk_id);
            state.send_timestamps.remove(chunk_id);
        }

        while state.acked.contains(&state.window_start) && state.window_start < state.total_chunks {
            state.window_start += 1;
        }
        state.window_end = (state.window_start + self.config.window_size).min(state.total_chunks);

        let out = self.arm_window(&sack.bundle_id, state, now);

        let completed = state.window_start >= state.total_chunks;
        if completed && !state.completed {
            state.completed = true;
            self.store
                .update_bundle_state(&sack.bundle_id, BundleState::Delivered)?;
            self.store.update_bundle_stats(
                &sack.bundle_id,
                Some(state.bytes_sent),
                Some(state.chunks_retransmitted),
            )?;
            state.chunk_cache.clear();
            info!(bundle_id = %sack.bundle_id, "transfer complete, all chunks acked");
        }

        Ok((out, completed))
    }

    /// Short-circuits completion on an inbound `DELIVERED`: marks the
    /// bundle completed, persists `state = delivered` and final counters,
    /// and drops the chunk cache — without waiting for a SACK that covers
    /// every chunk, including trailing FEC parity that may never arrive.
    pub fn handle_delivered(&self, bundle_id: &str, _now: f64) -> anyhow::Result<()> {
        let mut states = self.states.lock().unwrap();
        let Some(state) = states.get_mut(bundle_id) else {
            return Ok(());
        };
        if state.completed {
            return Ok(());
        }
        state.completed = true;
        self.store.update_bundle_state(bundle_id, BundleState::Delivered)?;
        self.store.update_bundle_stats(
            bundle_id,
            Some(state.bytes_sent),
            Some(state.chunks_retransmitted),
        )?;
        state.chunk_cache.clear();
        info!(bundle_id, "transfer complete, DELIVERED received");
        Ok(())
    }

    /// Sweeps every tracked bundle's chunk timers; any expired timer is
    /// enqueued for retransmission and its timeout doubles (capped at
    /// `max_rto_ms`). Returns the bundle ids with newly expired chunks.
    pub fn check_timeouts(&self, now: f64) -> Vec<String> {
        let mut touched = Vec::new();
        let mut states = self.states.lock().unwrap();
        for (bundle_id, state) in states.iter_mut() {
            if state.completed {
                continue;
            }
            let expired: Vec<u32> = state
                .chunk_timers
                .iter()
                .filter(|(_, &deadline)| deadline <= now)
                .map(|(&c, _)| c)
                .collect();
            if expired.is_empty() {
                continue;
            }
            for chunk_id in expired {
                state.chunk_timers.remove(&chunk_id);
                state.retransmit_queue.push_back(chunk_id);
                state.retransmitted_chunks.insert(chunk_id);
                state.chunks_retransmitted += 1;
            }
            state.timeout_interval_ms = (state.timeout_interval_ms * 2.0).min(self.config.max_rto_ms);
            touched.push(bundle_id.clone());
        }
        touched
    }

    /// Drains a bundle's retransmit queue, re-arming timers and
    /// returning the `DATA` datagrams to resend.
    pub fn retransmit_chunks(&self, bundle_id: &str, now: f64) -> Vec<DataMsg> {
        let mut states = self.states.lock().unwrap();
        let Some(state) = states.get_mut(bundle_id) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        while let Some(chunk_id) = state.retransmit_queue.pop_front() {
            if state.acked.contains(&chunk_id) {
                continue;
            }
            if let Some(msg) = self.build_data_msg(bundle_id, state, chunk_id) {
                state.chunk_timers.insert(chunk_id, now + state.timeout_interval_ms / 1000.0);
                out.push(msg);
            }
        }
        out
    }

    pub fn get_send_status(&self, bundle_id: &str) -> Option<SendStatus> {
        let states = self.states.lock().unwrap();
        let state = states.get(bundle_id)?;
        Some(SendStatus {
            bundle_id: bundle_id.to_string(),
            total_chunks: state.total_chunks,
            acked_chunks: state.acked.len() as u32,
            progress: if state.total_chunks == 0 {
                1.0
            } else {
                state.acked.len() as f64 / state.total_chunks as f64
            },
            bytes_sent: state.bytes_sent,
            chunks_retransmitted: state.chunks_retransmitted,
            completed: state.completed,
            window_start: state.window_start,
            window_end: state.window_end,
            timeout_interval_ms: state.timeout_interval_ms,
            smoothed_rtt_ms: state.srtt_ms,
        })
    }

    /// Drops completed transfers from memory; durable state remains in
    /// the store.
    pub fn cleanup_completed_transfers(&self) {
        let mut states = self.states.lock().unwrap();
        states.retain(|_, s| !s.completed);
    }

    /// Reloads bundles left in `sending` state (e.g. after a restart)
    /// and reconstitutes a `SendState` for each with `window_start`
    /// reset to zero — the acked set is not persisted, so resumption
    /// deliberately re-sends everything rather than guessing what
    /// already landed.
    pub fn resume_transfers(&self, now: f64) -> anyhow::Result<()> {
        let sending = self.store.list_bundles_by_state(BundleState::Sending)?;
        let mut states = self.states.lock().unwrap();
        for bundle in sending {
            if states.contains_key(&bundle.bundle_id) {
                continue;
            }
            let chunks = self.store.load_chunks_for_bundle(&bundle.bundle_id)?;
            let mut chunk_cache = HashMap::new();
            for c in &chunks {
                chunk_cache.insert(
                    c.chunk_id,
                    (c.block_id, c.k, c.r, c.checksum, Bytes::from(c.payload.clone())),
                );
            }
            let mut state = SendState {
                dest: bundle.dst.clone(),
                total_chunks: bundle.total_chunks,
                window_start: 0,
                window_end: 0,
                chunk_timers: HashMap::new(),
                send_timestamps: HashMap::new(),
                retransmitted_chunks: HashSet::new(),
                acked: BTreeSet::new(),
                retransmit_queue: VecDeque::new(),
                timeout_interval_ms: self.config.base_rto_ms,
                srtt_ms: None,
                rttvar_ms: None,
                completed: false,
                bytes_sent: 0,
                chunks_retransmitted: 0,
                chunk_cache,
            };
            state.window_end = state.initial_window_end(self.config.window_size);
            let _ = self.arm_window(&bundle.bundle_id, &mut state, now);
            warn!(bundle_id = %bundle.bundle_id, "resuming transfer, re-sending from chunk 0");
            states.insert(bundle.bundle_id.clone(), state);
        }
        Ok(())
    }

    /// The destination node registered for a tracked bundle, so the
    /// dispatcher knows where to send retransmissions and timer-driven
    /// datagrams without threading the address through every call.
    pub fn get_destination(&self, bundle_id: &str) -> Option<String> {
        self.states.lock().unwrap().get(bundle_id).map(|s| s.dest.clone())
    }
}

fn update_rtt_estimates(state: &mut SendState, rtt_ms: f64, max_rto_ms: f64) {
    match (state.srtt_ms, state.rttvar_ms) {
        (None, _) => {
            state.srtt_ms = Some(rtt_ms);
            state.rttvar_ms = Some(rtt_ms / 2.0);
        }
        (Some(srtt), Some(rttvar)) => {
            let rttvar_new = 0.75 * rttvar + 0.25 * (srtt - rtt_ms).abs();
            let srtt_new = 0.875 * srtt + 0.125 * rtt_ms;
            state.srtt_ms = Some(srtt_new);
            state.rttvar_ms = Some(rttvar_new);
        }
        _ => unreachable!(),
    }
    let srtt = state.srtt_ms.unwrap();
    let rttvar = state.rttvar_ms.unwrap();
    state.timeout_interval_ms = (srtt + 4.0 * rttvar).clamp(100.0, max_rto_ms.max(100.0));
}

struct PlannedChunk {
    chunk_id: u32,
    block_id: u32,
    k: u16,
    r: u16,
    checksum: u32,
    payload: Bytes,
}

/// Splits `data` into data chunks of `chunk_size`, then — if FEC is
/// enabled — appends `r` XOR-parity chunks per block of `k` data
/// chunks. Returns the full chunk list plus the number of data
/// (non-parity) chunks.
fn create_chunks(data: &[u8], chunk_size: usize, fec: FecConfig) -> (Vec<PlannedChunk>, u32) {
    let mut data_chunks = Vec::new();
    if data.is_empty() {
        return (Vec::new(), 0);
    }
    for (i, window) in data.chunks(chunk_size).enumerate() {
        let payload = Bytes::copy_from_slice(window);
        data_chunks.push(PlannedChunk {
            chunk_id: i as u32,
            block_id: 0,
            k: fec.k,
            r: fec.r,
            checksum: wire::crc32(&payload),
            payload,
        });
    }
    let num_data_chunks = data_chunks.len() as u32;

    if !fec.enabled || fec.k == 0 {
        return (data_chunks, num_data_chunks);
    }

    let mut all_chunks = Vec::with_capacity(data_chunks.len());
    let mut next_chunk_id = num_data_chunks;
    let mut block_id = 0u32;
    for block in data_chunks.chunks(fec.k as usize) {
        for c in block {
            all_chunks.push(PlannedChunk {
                chunk_id: c.chunk_id,
                block_id,
                k: c.k,
                r: c.r,
                checksum: c.checksum,
                payload: c.payload.clone(),
            });
        }
        let payloads: Vec<Bytes> = block.iter().map(|c| c.payload.clone()).collect();
        for parity in generate_parity(&payloads, fec.r) {
            all_chunks.push(PlannedChunk {
                chunk_id: next_chunk_id,
                block_id,
                k: fec.k,
                r: fec.r,
                checksum: wire::crc32(&parity),
                payload: parity,
            });
            next_chunk_id += 1;
        }
        block_id += 1;
    }
    (all_chunks, num_data_chunks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_store::SqliteStore;

    fn engine() -> SendEngine {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        SendEngine::new(store, SendConfig::default())
    }

    #[test]
    fn start_transfer_produces_initial_window() {
        let engine = engine();
        let data = vec![0u8; 5000];
        let out = engine
            .start_transfer("b1", "src", "dst", &data, FecConfig::default(), 0.0)
            .unwrap();
        assert!(!out.is_empty());
        let status = engine.get_send_status("b1").unwrap();
        assert!(status.total_chunks > 0);
        assert!(!status.completed);
    }

    #[test]
    fn sack_advances_window_and_completes() {
        let engine = engine();
        let data = vec![1u8; 1150 * 3];
        engine
            .start_transfer("b1", "src", "dst", &data, FecConfig { enabled: false, k: 4, r: 0 }, 0.0)
            .unwrap();
        let status = engine.get_send_status("b1").unwrap();
        let total = status.total_chunks;

        let acked: BTreeSet<u32> = (0..total).collect();
        let (watermark, bitmap) = wire::compute_sack_window(&acked);
        let sack = SackMsg {
            bundle_id: "b1".to_string(),
            recv_watermark: watermark,
            bitmap,
        };
        let (_, completed) = engine.handle_sack(&sack, 1.0).unwrap();
        assert!(completed);
    }

    #[test]
    fn timeout_backoff_scenario() {
        // 8-byte file, chunk_size=4, window_size=4, base_rto_ms=50,
        // max_rto_ms=1000: forcing every chunk timer to 0 and ticking once
        // must produce a non-empty retransmit queue and a strictly larger,
        // still-bounded RTO.
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let engine = SendEngine::new(
            store,
            SendConfig {
                chunk_size: 4,
                window_size: 4,
                base_rto_ms: 50.0,
                max_rto_ms: 1000.0,
                ttl_sec: 300,
                pacing_delay_ms: 0,
            },
        );
        let data = vec![7u8; 8];
        engine
            .start_transfer("b1", "src", "dst", &data, FecConfig { enabled: false, k: 4, r: 0 }, 0.0)
            .unwrap();

        {
            let mut states = engine.states.lock().unwrap();
            let state = states.get_mut("b1").unwrap();
            for timer in state.chunk_timers.values_mut() {
                *timer = 0.0;
            }
        }

        let touched = engine.check_timeouts(0.0);
        assert_eq!(touched, vec!["b1".to_string()]);
        let resent = engine.retransmit_chunks("b1", 0.0);
        assert!(!resent.is_empty());

        let status = engine.get_send_status("b1").unwrap();
        assert!(status.timeout_interval_ms > 50.0);
        assert!(status.timeout_interval_ms <= 1000.0);
    }

    #[test]
    fn timeout_enqueues_retransmit_and_doubles_interval() {
        let engine = engine();
        let data = vec![1u8; 1150];
        engine
            .start_transfer("b1", "src", "dst", &data, FecConfig { enabled: false, k: 4, r: 0 }, 0.0)
            .unwrap();
        let before = engine.get_send_status("b1").unwrap().timeout_interval_ms;
        let touched = engine.check_timeouts(10_000.0);
        assert_eq!(touched, vec!["b1".to_string()]);
        let after = engine.get_send_status("b1").unwrap().timeout_interval_ms;
        assert!(after > before);
        let resent = engine.retransmit_chunks("b1", 10_000.0);
        assert_eq!(resent.len(), 1);
    }

    #[test]
    fn delivered_completes_transfer_without_full_sack() {
        let engine = engine();
        let data = vec![1u8; 1150 * 3];
        engine
            .start_transfer("b1", "src", "dst", &data, FecConfig { enabled: true, k: 4, r: 2 }, 0.0)
            .unwrap();
        assert!(!engine.get_send_status("b1").unwrap().completed);

        engine.handle_delivered("b1", 1.0).unwrap();

        let status = engine.get_send_status("b1").unwrap();
        assert!(status.completed);

        // idempotent: a second DELIVERED does not error or re-finalize
        engine.handle_delivered("b1", 2.0).unwrap();
    }

    #[test]
    fn fec_parity_chunks_follow_data_chunks() {
        let (chunks, num_data) = create_chunks(&vec![7u8; 1150 * 4], 1150, FecConfig { enabled: true, k: 4, r: 2 });
        assert_eq!(num_data, 4);
        assert_eq!(chunks.len(), 6);
        assert!(chunks[4].chunk_id >= num_data);
    }
}
