//! # Receive Engine
//!
//! Pure logic plus the durable [`Store`] — no socket I/O. Accepts
//! inbound `DATA` chunks, infers the FEC block layout from
//! `total_chunks` alone (the sender never states it explicitly),
//! reconstructs single-loss blocks, batches chunk writes, and emits
//! `SACK`/`DELIVERED` datagrams for the dispatcher to send.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use rand::Rng;
use serde::Serialize;
use tracing::debug;

use courier_store::{BundleRecord, BundleState, ChunkRecord, Store};

use crate::fec::reconstruct_single_loss;
use crate::wire::{self, compute_sack_window, CustodyAckMsg, DataMsg, SackMsg};

#[derive(Debug, Clone)]
pub struct ReceiveConfig {
    pub ttl_sec: u64,
    pub sack_every: u32,
    pub flush_every: usize,
}

impl Default for ReceiveConfig {
    fn default() -> Self {
        ReceiveConfig {
            ttl_sec: 300,
            sack_every: 50,
            flush_every: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReceiveStatus {
    pub bundle_id: String,
    pub total_chunks: u32,
    pub received_chunks: u32,
    pub progress: f64,
    pub delivered: bool,
}

/// Outcome of feeding one `DATA` datagram to the engine.
#[derive(Debug, Default)]
pub struct HandleDataOutcome {
    pub sack: Option<SackMsg>,
    pub delivered: bool,
    pub file_bytes: Option<Vec<u8>>,
    pub custody_ack: Option<CustodyAckMsg>,
}

struct ReceiveState {
    #[allow(dead_code)]
    src: String,
    total_chunks: u32,
    fec_enabled: bool,
    k: u16,
    num_data_chunks: u32,
    received_chunks: HashSet<u32>,
    data_chunks: HashMap<u32, Bytes>,
    parity_chunks: HashMap<u32, Vec<Bytes>>,
    delivered: bool,
    write_buffer: Vec<ChunkRecord>,
}

pub struct ReceiveEngine {
    store: Arc<dyn Store>,
    config: ReceiveConfig,
    own_node: String,
    states: Mutex<HashMap<String, ReceiveState>>,
}

impl ReceiveEngine {
    pub fn new(store: Arc<dyn Store>, own_node: String, config: ReceiveConfig) -> Self {
        ReceiveEngine {
            store,
            config,
            own_node,
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn handle_data(
        &self,
        msg: &DataMsg,
        src: &str,
        now: f64,
    ) -> anyhow::Result<HandleDataOutcome> {
        if msg.checksum != wire::crc32(&msg.payload) {
            debug!(bundle_id = %msg.bundle_id, chunk_id = msg.chunk_id, "dropping DATA with bad checksum");
            return Ok(HandleDataOutcome::default());
        }

        let mut states = self.states.lock().unwrap();
        if !states.contains_key(&msg.bundle_id) {
            let (num_data_chunks, fec_enabled) =
                infer_block_and_data_count(msg.total_chunks, msg.k, msg.r);
            self.store.save_bundle(&BundleRecord {
                bundle_id: msg.bundle_id.clone(),
                src: src.to_string(),
                dst: self.own_node.clone(),
                ttl: self.config.ttl_sec,
                state: BundleState::Receiving.as_str().to_string(),
                total_chunks: msg.total_chunks,
                bytes_sent: 0,
                chunks_retransmitted: 0,
                fec_enabled,
                k: msg.k,
                r: msg.r,
                created_at: now.to_string(),
                file_path: String::new(),
                file_size: 0,
            })?;
            states.insert(
                msg.bundle_id.clone(),
                ReceiveState {
                    src: src.to_string(),
                    total_chunks: msg.total_chunks,
                    fec_enabled,
                    k: msg.k,
                    num_data_chunks,
                    received_chunks: HashSet::new(),
                    data_chunks: HashMap::new(),
                    parity_chunks: HashMap::new(),
                    delivered: false,
                    write_buffer: Vec::new(),
                },
            );
        }
        let state = states.get_mut(&msg.bundle_id).unwrap();

        if state.received_chunks.contains(&msg.chunk_id) {
            let sack = self.build_sack(&msg.bundle_id, state);
            return Ok(HandleDataOutcome {
                sack: Some(sack),
                delivered: state.delivered,
                file_bytes: None,
                custody_ack: None,
            });
        }

        state.received_chunks.insert(msg.chunk_id);
        let is_parity = state.fec_enabled && msg.chunk_id >= state.num_data_chunks;
        if is_parity {
            state
                .parity_chunks
                .entry(msg.block_id)
                .or_default()
                .push(msg.payload.clone());
        } else {
            state.data_chunks.insert(msg.chunk_id, msg.payload.clone());
        }

        state.write_buffer.push(ChunkRecord {
            bundle_id: msg.bundle_id.clone(),
            chunk_id: msg.chunk_id,
            is_parity,
            block_id: msg.block_id,
            k: msg.k,
            r: msg.r,
            payload: msg.payload.to_vec(),
            checksum: msg.checksum,
            flags: msg.flags,
        });

        if state.fec_enabled {
            try_fec_reconstruct(state, msg.block_id);
        }

        let mut outcome = HandleDataOutcome::default();

        let all_present = (0..state.num_data_chunks).all(|c| state.data_chunks.contains_key(&c));
        if all_present && !state.delivered {
            let mut bytes = Vec::new();
            for c in 0..state.num_data_chunks {
                bytes.extend_from_slice(&state.data_chunks[&c]);
            }
            state.delivered = true;
            outcome.file_bytes = Some(bytes);
            outcome.delivered = true;
            outcome.custody_ack = Some(CustodyAckMsg {
                bundle_id: msg.bundle_id.clone(),
                ack_nonce: rand::rng().random(),
                ranges: Vec::new(),
            });
            self.store
                .update_bundle_state(&msg.bundle_id, BundleState::Delivered)?;
        }

        let should_flush = state.write_buffer.len() >= self.config.flush_every || all_present;
        if should_flush && !state.write_buffer.is_empty() {
            self.store.save_chunks_bulk(&state.write_buffer)?;
            state.write_buffer.clear();
        }

        if state.received_chunks.len() as u32 % self.config.sack_every == 0 || all_present {
            outcome.sack = Some(self.build_sack(&msg.bundle_id, state));
        }

        Ok(outcome)
    }

    fn build_sack(&self, bundle_id: &str, state: &ReceiveState) -> SackMsg {
        let acked: std::collections::BTreeSet<u32> =
            state.received_chunks.iter().copied().collect();
        let (recv_watermark, bitmap) = compute_sack_window(&acked);
        SackMsg {
            bundle_id: bundle_id.to_string(),
            recv_watermark,
            bitmap,
        }
    }

    pub fn get_receive_status(&self, bundle_id: &str) -> Option<ReceiveStatus> {
        let states = self.states.lock().unwrap();
        let state = states.get(bundle_id)?;
        Some(ReceiveStatus {
            bundle_id: bundle_id.to_string(),
            total_chunks: state.total_chunks,
            received_chunks: state.received_chunks.len() as u32,
            progress: if state.num_data_chunks == 0 {
                1.0
            } else {
                state.data_chunks.len() as f64 / state.num_data_chunks as f64
            },
            delivered: state.delivered,
        })
    }
}

/// Brute-forces the block count `B` and derives `num_data_chunks` from
/// `total_chunks = num_data + r*B` with the constraint
/// `k*(B-1) < num_data <= k*B`. Disables FEC if no `B` satisfies it —
/// this happens for a short final block, or whenever the sender did
/// not use FEC at all.
fn infer_block_and_data_count(total_chunks: u32, k: u16, r: u16) -> (u32, bool) {
    if k == 0 || r == 0 {
        return (total_chunks, false);
    }
    let k = k as u32;
    let r = r as u32;
    for b in 1..=total_chunks.max(1) {
        if r * b > total_chunks {
            break;
        }
        let num_data = total_chunks - r * b;
        if k * (b - 1) < num_data && num_data <= k * b {
            return (num_data, true);
        }
    }
    (total_chunks, false)
}

/// Reconstructs a block's single missing data chunk from its parity,
/// if exactly one data chunk in the block is absent and at least one
/// parity copy has arrived.
fn try_fec_reconstruct(state: &mut ReceiveState, block_id: u32) {
    let k = state.k as u32;
    let block_start = block_id * k;
    let block_end = (block_start + k).min(state.num_data_chunks);
    if block_start >= block_end {
        return;
    }

    let missing: Vec<u32> = (block_start..block_end)
        .filter(|c| !state.data_chunks.contains_key(c))
        .collect();
    if missing.len() != 1 {
        return;
    }
    let Some(parities) = state.parity_chunks.get(&block_id) else {
        return;
    };
    let Some(parity) = parities.first() else {
        return;
    };

    let present: Vec<Bytes> = (block_start..block_end)
        .filter(|c| *c != missing[0])
        .filter_map(|c| state.data_chunks.get(&c).cloned())
        .collect();
    let missing_len = parity.len();
    let recovered = reconstruct_single_loss(&present, missing_len, parity);
    debug!(chunk_id = missing[0], block_id, "FEC-reconstructed missing chunk");
    state.data_chunks.insert(missing[0], recovered);
    state.received_chunks.insert(missing[0]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_store::SqliteStore;

    fn engine() -> ReceiveEngine {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        ReceiveEngine::new(store, "node-b".to_string(), ReceiveConfig::default())
    }

    fn data_msg(bundle_id: &str, chunk_id: u32, total: u32, payload: &[u8]) -> DataMsg {
        DataMsg {
            bundle_id: bundle_id.to_string(),
            chunk_id,
            total_chunks: total,
            block_id: 0,
            k: 0,
            r: 0,
            checksum: wire::crc32(payload),
            flags: 0,
            payload: Bytes::copy_from_slice(payload),
        }
    }

    #[test]
    fn delivers_file_once_all_data_chunks_present() {
        let engine = engine();
        let c0 = data_msg("b1", 0, 2, b"hello ");
        let c1 = data_msg("b1", 1, 2, b"world!");
        engine.handle_data(&c0, "node-a", 0.0).unwrap();
        let outcome = engine.handle_data(&c1, "node-a", 0.1).unwrap();
        assert!(outcome.delivered);
        assert_eq!(outcome.file_bytes.unwrap(), b"hello world!".to_vec());
    }

    #[test]
    fn corrupted_checksum_is_dropped_silently() {
        let engine = engine();
        let mut c0 = data_msg("b1", 0, 2, b"hello ");
        c0.checksum ^= 1;
        let outcome = engine.handle_data(&c0, "node-a", 0.0).unwrap();
        assert!(outcome.sack.is_none());
        assert!(!outcome.delivered);
        assert!(outcome.file_bytes.is_none());
        assert!(engine.get_receive_status("b1").is_none());
    }

    #[test]
    fn delivery_emits_empty_range_custody_ack() {
        let engine = engine();
        let c0 = data_msg("b1", 0, 2, b"hello ");
        let c1 = data_msg("b1", 1, 2, b"world!");
        engine.handle_data(&c0, "node-a", 0.0).unwrap();
        let outcome = engine.handle_data(&c1, "node-a", 0.1).unwrap();
        let ack = outcome.custody_ack.expect("delivery should emit a custody ack");
        assert_eq!(ack.bundle_id, "b1");
        assert!(ack.ranges.is_empty());
    }

    #[test]
    fn duplicate_chunk_resends_sack_without_reprocessing() {
        let engine = engine();
        let c0 = data_msg("b1", 0, 2, b"hello ");
        engine.handle_data(&c0, "node-a", 0.0).unwrap();
        let outcome = engine.handle_data(&c0, "node-a", 0.1).unwrap();
        assert!(outcome.sack.is_some());
        assert!(!outcome.delivered);
    }

    #[test]
    fn infers_no_fec_when_k_or_r_is_zero() {
        let (num_data, fec) = infer_block_and_data_count(4, 0, 0);
        assert_eq!(num_data, 4);
        assert!(!fec);
    }

    #[test]
    fn infers_block_layout_with_fec() {
        // one block of k=4 data chunks + r=2 parity -> total 6
        let (num_data, fec) = infer_block_and_data_count(6, 4, 2);
        assert_eq!(num_data, 4);
        assert!(fec);
    }

    #[test]
    fn fec_reconstructs_single_missing_data_chunk() {
        let engine = engine();
        let a = b"AAAA".to_vec();
        let b = b"BBBB".to_vec();
        let parity: Vec<u8> = a.iter().zip(b.iter()).map(|(x, y)| x ^ y).collect();

        let msg_a = DataMsg {
            bundle_id: "b1".to_string(),
            chunk_id: 0,
            total_chunks: 3,
            block_id: 0,
            k: 2,
            r: 1,
            checksum: wire::crc32(&a),
            flags: 0,
            payload: Bytes::from(a.clone()),
        };
        let msg_parity = DataMsg {
            bundle_id: "b1".to_string(),
            chunk_id: 2,
            total_chunks: 3,
            block_id: 0,
            k: 2,
            r: 1,
            checksum: wire::crc32(&parity),
            flags: 0,
            payload: Bytes::from(parity),
        };
        engine.handle_data(&msg_a, "node-a", 0.0).unwrap();
        let outcome = engine.handle_data(&msg_parity, "node-a", 0.1).unwrap();
        assert!(outcome.delivered);
        assert_eq!(outcome.file_bytes.unwrap(), [a, b].concat());
    }
}
