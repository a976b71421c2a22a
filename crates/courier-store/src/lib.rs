//! Durable storage for Courier bundles, chunks, and custody records.
//!
//! The [`Store`] trait is the capability set the rest of Courier depends
//! on; [`SqliteStore`] is the only implementation, backed by `rusqlite`
//! with WAL journaling. Callers on any thread may use a `Store` freely —
//! implementations serialize writers internally.

mod error;
mod sqlite;

pub use error::StoreError;
pub use sqlite::SqliteStore;

use serde::{Deserialize, Serialize};

pub type Result<T> = std::result::Result<T, StoreError>;

/// A bundle's lifecycle state. Moves forward only:
/// `Sending|Receiving` → `Delivered`; `CustodyTransferred` is an
/// orthogonal tag applied by the sender when custody is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BundleState {
    Sending,
    Receiving,
    Delivered,
    CustodyTransferred,
    Expired,
}

impl BundleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BundleState::Sending => "sending",
            BundleState::Receiving => "receiving",
            BundleState::Delivered => "delivered",
            BundleState::CustodyTransferred => "custody_transferred",
            BundleState::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "sending" => BundleState::Sending,
            "receiving" => BundleState::Receiving,
            "delivered" => BundleState::Delivered,
            "custody_transferred" => BundleState::CustodyTransferred,
            "expired" => BundleState::Expired,
            _ => return None,
        })
    }
}

/// Durable bundle metadata row. Mirrors the `bundles` table (§3, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleRecord {
    pub bundle_id: String,
    pub src: String,
    pub dst: String,
    pub ttl: u64,
    pub state: String,
    pub total_chunks: u32,
    pub bytes_sent: u64,
    pub chunks_retransmitted: u64,
    pub fec_enabled: bool,
    pub k: u16,
    pub r: u16,
    pub created_at: String,
    pub file_path: String,
    pub file_size: u64,
}

/// A single durable chunk row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub bundle_id: String,
    pub chunk_id: u32,
    pub is_parity: bool,
    pub block_id: u32,
    pub k: u16,
    pub r: u16,
    pub payload: Vec<u8>,
    pub checksum: u32,
    pub flags: u8,
}

/// Durable custody record row. `chunk_ranges` is stored as a JSON array
/// of `[lo, hi]` pairs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustodyRecordRow {
    pub bundle_id: String,
    pub owner_node: String,
    pub chunk_ranges: Vec<(u32, u32)>,
    pub retry_timer: f64,
    pub retry_count: u32,
    pub max_retries: u32,
    pub state: String,
    pub acquired_at: String,
}

/// Capability set the rest of Courier depends on (design note §9:
/// "Polymorphic storage"). The default binding is SQL-backed but
/// callers must not assume that.
pub trait Store: Send + Sync {
    fn save_bundle(&self, bundle: &BundleRecord) -> Result<()>;
    fn load_bundle(&self, bundle_id: &str) -> Result<Option<BundleRecord>>;
    fn update_bundle_state(&self, bundle_id: &str, state: BundleState) -> Result<()>;
    fn update_bundle_stats(
        &self,
        bundle_id: &str,
        bytes_sent: Option<u64>,
        chunks_retransmitted: Option<u64>,
    ) -> Result<()>;
    fn list_bundles(&self) -> Result<Vec<BundleRecord>>;
    fn list_bundles_by_state(&self, state: BundleState) -> Result<Vec<BundleRecord>>;

    /// Atomic bulk write: either all rows are durable or none are.
    /// This is the only chunk-write path — the hot receive/send path
    /// must never commit per-chunk.
    fn save_chunks_bulk(&self, chunks: &[ChunkRecord]) -> Result<()>;
    fn load_chunks_for_bundle(&self, bundle_id: &str) -> Result<Vec<ChunkRecord>>;

    fn save_custody_record(&self, record: &CustodyRecordRow) -> Result<()>;
    fn load_custody_record(&self, bundle_id: &str) -> Result<Option<CustodyRecordRow>>;

    /// Cascading delete across chunks, custody_records, bundles.
    fn delete_bundle(&self, bundle_id: &str) -> Result<()>;

    /// Deletes bundles whose `(now - created_at) > ttl`, cascading.
    fn cleanup_expired(&self, now_unix: f64) -> Result<Vec<String>>;
}
