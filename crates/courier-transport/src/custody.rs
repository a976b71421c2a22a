//! # Custody Manager
//!
//! Tracks custody transfer independently of chunk-level reliability.
//! A custody record moves `accepted -> complete` on a `DELIVERED`
//! notification, or `accepted -> failed` once its retry budget is
//! exhausted. Custody acks are never validated against the nonce that
//! was sent — the nonce is logged for traceability only, not checked,
//! matching the accept-any-custody-ack decision in the design notes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rand::Rng;
use tracing::{debug, warn};

use courier_store::{BundleState, CustodyRecordRow, Store};

use crate::wire::{CustodyAckMsg, CustodyReqMsg};

#[derive(Debug, Clone)]
pub struct CustodyConfig {
    pub max_retries: u32,
    pub backoff_base_sec: f64,
}

impl Default for CustodyConfig {
    fn default() -> Self {
        CustodyConfig {
            max_retries: 10,
            backoff_base_sec: 2.0,
        }
    }
}

/// A custody-request retry due for (re)transmission.
pub struct PendingRetry {
    pub bundle_id: String,
    pub message: CustodyReqMsg,
}

pub struct CustodyManager {
    store: Arc<dyn Store>,
    own_node: String,
    config: CustodyConfig,
    active_records: Mutex<HashMap<String, CustodyRecordRow>>,
}

impl CustodyManager {
    pub fn new(store: Arc<dyn Store>, own_node: String, config: CustodyConfig) -> Self {
        CustodyManager {
            store,
            own_node,
            config,
            active_records: Mutex::new(HashMap::new()),
        }
    }

    /// Receiver side: accept custody of the named ranges and reply with
    /// a `CUSTODY_ACK` carrying a fresh random nonce.
    pub fn handle_custody_req(
        &self,
        bundle_id: &str,
        owner_node: &str,
        ranges: Vec<(u32, u32)>,
        now: f64,
    ) -> anyhow::Result<CustodyAckMsg> {
        let record = CustodyRecordRow {
            bundle_id: bundle_id.to_string(),
            owner_node: owner_node.to_string(),
            chunk_ranges: ranges.clone(),
            retry_timer: now + self.config.backoff_base_sec,
            retry_count: 0,
            max_retries: self.config.max_retries,
            state: "accepted".to_string(),
            acquired_at: now.to_string(),
        };
        self.save_record(record)?;

        let ack_nonce: u64 = rand::rng().random();
        debug!(bundle_id, ack_nonce, "accepted custody request");
        Ok(CustodyAckMsg {
            bundle_id: bundle_id.to_string(),
            ack_nonce,
            ranges,
        })
    }

    /// Sender side: custody has been accepted by the next hop.
    pub fn handle_custody_ack(&self, bundle_id: &str, ack_nonce: u64) -> anyhow::Result<()> {
        debug!(bundle_id, ack_nonce, "custody accepted by peer");
        self.store
            .update_bundle_state(bundle_id, BundleState::CustodyTransferred)?;
        Ok(())
    }

    /// A bundle reached final delivery; close out any custody record we
    /// are holding for it.
    pub fn handle_delivered(&self, bundle_id: &str) -> anyhow::Result<()> {
        let mut guard = self.active_records.lock().unwrap();
        let mut record = match guard.get(bundle_id).cloned() {
            Some(r) => r,
            None => match self.store.load_custody_record(bundle_id)? {
                Some(r) => r,
                None => return Ok(()),
            },
        };
        if record.state != "complete" && record.state != "failed" {
            record.state = "complete".to_string();
            self.store.save_custody_record(&record)?;
            guard.insert(bundle_id.to_string(), record);
        }
        Ok(())
    }

    /// Scans all records with a due retry timer, bumping their retry
    /// count and exponential backoff, or marking them `failed` once the
    /// retry budget is exhausted. Returns the records still pending so
    /// the dispatcher can re-send a `CUSTODY_REQ`.
    pub fn check_retry_timers(&self, now: f64) -> anyhow::Result<Vec<PendingRetry>> {
        let mut due = Vec::new();
        let mut guard = self.active_records.lock().unwrap();
        let bundle_ids: Vec<String> = guard.keys().cloned().collect();
        for bundle_id in bundle_ids {
            let mut record = guard.get(&bundle_id).cloned().unwrap();
            if record.state != "accepted" || record.retry_timer > now {
                continue;
            }
            if record.retry_count >= record.max_retries {
                record.state = "failed".to_string();
                warn!(bundle_id = %bundle_id, "custody retries exhausted, marking failed");
            } else {
                record.retry_count += 1;
                let backoff = self.config.backoff_base_sec * 2f64.powi(record.retry_count as i32);
                record.retry_timer = now + backoff;
                due.push(PendingRetry {
                    bundle_id: bundle_id.clone(),
                    message: CustodyReqMsg {
                        bundle_id: bundle_id.clone(),
                        ttl_remaining: 0,
                        ranges: record.chunk_ranges.clone(),
                    },
                });
            }
            self.store.save_custody_record(&record)?;
            guard.insert(bundle_id, record);
        }
        Ok(due)
    }

    fn save_record(&self, record: CustodyRecordRow) -> anyhow::Result<()> {
        self.store.save_custody_record(&record)?;
        self.active_records
            .lock()
            .unwrap()
            .insert(record.bundle_id.clone(), record);
        Ok(())
    }

    #[cfg(test)]
    fn own_node(&self) -> &str {
        &self.own_node
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_store::SqliteStore;

    fn manager() -> CustodyManager {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        CustodyManager::new(store, "node-a".to_string(), CustodyConfig::default())
    }

    #[test]
    fn custody_req_accepts_and_acks() {
        let mgr = manager();
        assert_eq!(mgr.own_node(), "node-a");
        let ack = mgr
            .handle_custody_req("bundle1", "node-b", vec![(0, 10)], 1000.0)
            .unwrap();
        assert_eq!(ack.bundle_id, "bundle1");
        assert_eq!(ack.ranges, vec![(0, 10)]);
    }

    #[test]
    fn delivered_marks_record_complete() {
        let mgr = manager();
        mgr.handle_custody_req("bundle1", "node-b", vec![(0, 10)], 1000.0)
            .unwrap();
        mgr.handle_delivered("bundle1").unwrap();
        let record = mgr.active_records.lock().unwrap().get("bundle1").unwrap().clone();
        assert_eq!(record.state, "complete");
    }

    #[test]
    fn custody_accept_and_retry_scenario() {
        // CUSTODY_REQ ranges=[(0,10)], backoff_base_sec=1, max_retries=3:
        // immediate ack with the same ranges, retry_count climbs to 1 after
        // one forced tick, and failed after max_retries forced ticks.
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let mgr = CustodyManager::new(
            store,
            "node-a".to_string(),
            CustodyConfig {
                max_retries: 3,
                backoff_base_sec: 1.0,
            },
        );

        let ack = mgr
            .handle_custody_req("bundle1", "node-b", vec![(0, 10)], 1000.0)
            .unwrap();
        assert_eq!(ack.ranges, vec![(0, 10)]);
        {
            let record = mgr.active_records.lock().unwrap().get("bundle1").unwrap().clone();
            assert_eq!(record.state, "accepted");
        }

        {
            let mut guard = mgr.active_records.lock().unwrap();
            guard.get_mut("bundle1").unwrap().retry_timer = 0.0;
        }
        mgr.check_retry_timers(1000.0).unwrap();
        {
            let record = mgr.active_records.lock().unwrap().get("bundle1").unwrap().clone();
            assert_eq!(record.retry_count, 1);
            assert_eq!(record.state, "accepted");
        }

        for _ in 0..3 {
            let mut guard = mgr.active_records.lock().unwrap();
            guard.get_mut("bundle1").unwrap().retry_timer = 0.0;
            drop(guard);
            mgr.check_retry_timers(1000.0).unwrap();
        }
        let record = mgr.active_records.lock().unwrap().get("bundle1").unwrap().clone();
        assert_eq!(record.state, "failed");
    }

    #[test]
    fn retry_timer_backs_off_and_eventually_fails() {
        let mgr = manager();
        mgr.handle_custody_req("bundle1", "node-b", vec![(0, 10)], 1000.0)
            .unwrap();
        {
            let mut guard = mgr.active_records.lock().unwrap();
            let r = guard.get_mut("bundle1").unwrap();
            r.max_retries = 1;
        }
        let due = mgr.check_retry_timers(2000.0).unwrap();
        assert_eq!(due.len(), 1);
        let due_again = mgr.check_retry_timers(100_000.0).unwrap();
        assert!(due_again.is_empty());
        let record = mgr.active_records.lock().unwrap().get("bundle1").unwrap().clone();
        assert_eq!(record.state, "failed");
    }
}
