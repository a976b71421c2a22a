use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::{
    BundleRecord, BundleState, ChunkRecord, CustodyRecordRow, Result, Store, StoreError,
};

/// SQLite-backed [`Store`]. A single connection guarded by a mutex,
/// matching the reference implementation's `threading.RLock`-guarded
/// `sqlite3.connect(..., check_same_thread=False)`.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        let store = SqliteStore {
            conn: Mutex::new(conn),
        };
        store.init_tables()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = SqliteStore {
            conn: Mutex::new(conn),
        };
        store.init_tables()?;
        Ok(store)
    }

    fn init_tables(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS bundles (
                bundle_id TEXT PRIMARY KEY,
                src TEXT NOT NULL,
                dst TEXT NOT NULL,
                ttl INTEGER NOT NULL,
                state TEXT NOT NULL,
                total_chunks INTEGER NOT NULL,
                bytes_sent INTEGER DEFAULT 0,
                chunks_retransmitted INTEGER DEFAULT 0,
                fec_enabled BOOLEAN DEFAULT 0,
                k INTEGER DEFAULT 0,
                r INTEGER DEFAULT 0,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                file_path TEXT,
                file_size INTEGER DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS chunks (
                bundle_id TEXT NOT NULL,
                chunk_id INTEGER NOT NULL,
                is_parity BOOLEAN DEFAULT 0,
                block_id INTEGER NOT NULL,
                k INTEGER NOT NULL,
                r INTEGER NOT NULL,
                payload BLOB NOT NULL,
                checksum TEXT NOT NULL,
                flags INTEGER DEFAULT 0,
                PRIMARY KEY (bundle_id, chunk_id),
                FOREIGN KEY (bundle_id) REFERENCES bundles(bundle_id)
            );

            CREATE TABLE IF NOT EXISTS custody_records (
                bundle_id TEXT PRIMARY KEY,
                owner_node TEXT NOT NULL,
                chunk_ranges TEXT NOT NULL,
                retry_timer TIMESTAMP NOT NULL,
                retry_count INTEGER DEFAULT 0,
                max_retries INTEGER DEFAULT 10,
                state TEXT NOT NULL,
                acquired_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                FOREIGN KEY (bundle_id) REFERENCES bundles(bundle_id)
            );
            "#,
        )?;
        Ok(())
    }

    fn row_to_bundle(row: &rusqlite::Row) -> rusqlite::Result<BundleRecord> {
        Ok(BundleRecord {
            bundle_id: row.get("bundle_id")?,
            src: row.get("src")?,
            dst: row.get("dst")?,
            ttl: row.get("ttl")?,
            state: row.get("state")?,
            total_chunks: row.get("total_chunks")?,
            bytes_sent: row.get("bytes_sent")?,
            chunks_retransmitted: row.get("chunks_retransmitted")?,
            fec_enabled: row.get("fec_enabled")?,
            k: row.get("k")?,
            r: row.get("r")?,
            created_at: row.get("created_at")?,
            file_path: row.get::<_, Option<String>>("file_path")?.unwrap_or_default(),
            file_size: row.get("file_size")?,
        })
    }

    fn row_to_chunk(row: &rusqlite::Row) -> rusqlite::Result<ChunkRecord> {
        let checksum_str: String = row.get("checksum")?;
        Ok(ChunkRecord {
            bundle_id: row.get("bundle_id")?,
            chunk_id: row.get("chunk_id")?,
            is_parity: row.get("is_parity")?,
            block_id: row.get("block_id")?,
            k: row.get("k")?,
            r: row.get("r")?,
            payload: row.get("payload")?,
            checksum: checksum_str.parse().unwrap_or(0),
            flags: row.get("flags")?,
        })
    }
}

impl Store for SqliteStore {
    fn save_bundle(&self, bundle: &BundleRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO bundles
             (bundle_id, src, dst, ttl, state, total_chunks, bytes_sent,
              chunks_retransmitted, fec_enabled, k, r, file_path, file_size)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                bundle.bundle_id,
                bundle.src,
                bundle.dst,
                bundle.ttl,
                bundle.state,
                bundle.total_chunks,
                bundle.bytes_sent,
                bundle.chunks_retransmitted,
                bundle.fec_enabled,
                bundle.k,
                bundle.r,
                bundle.file_path,
                bundle.file_size,
            ],
        )?;
        Ok(())
    }

    fn load_bundle(&self, bundle_id: &str) -> Result<Option<BundleRecord>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM bundles WHERE bundle_id = ?1",
            params![bundle_id],
            Self::row_to_bundle,
        )
        .optional()
        .map_err(StoreError::from)
    }

    fn update_bundle_state(&self, bundle_id: &str, state: BundleState) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE bundles SET state = ?1 WHERE bundle_id = ?2",
            params![state.as_str(), bundle_id],
        )?;
        Ok(())
    }

    fn update_bundle_stats(
        &self,
        bundle_id: &str,
        bytes_sent: Option<u64>,
        chunks_retransmitted: Option<u64>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        if let Some(b) = bytes_sent {
            conn.execute(
                "UPDATE bundles SET bytes_sent = ?1 WHERE bundle_id = ?2",
                params![b, bundle_id],
            )?;
        }
        if let Some(c) = chunks_retransmitted {
            conn.execute(
                "UPDATE bundles SET chunks_retransmitted = ?1 WHERE bundle_id = ?2",
                params![c, bundle_id],
            )?;
        }
        Ok(())
    }

    fn list_bundles(&self) -> Result<Vec<BundleRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT * FROM bundles ORDER BY created_at DESC")?;
        let rows = stmt
            .query_map([], Self::row_to_bundle)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn list_bundles_by_state(&self, state: BundleState) -> Result<Vec<BundleRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT * FROM bundles WHERE state = ?1 ORDER BY created_at DESC")?;
        let rows = stmt
            .query_map(params![state.as_str()], Self::row_to_bundle)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn save_chunks_bulk(&self, chunks: &[ChunkRecord]) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO chunks
                 (bundle_id, chunk_id, is_parity, block_id, k, r, payload, checksum, flags)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            for c in chunks {
                stmt.execute(params![
                    c.bundle_id,
                    c.chunk_id,
                    c.is_parity,
                    c.block_id,
                    c.k,
                    c.r,
                    c.payload,
                    c.checksum.to_string(),
                    c.flags,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn load_chunks_for_bundle(&self, bundle_id: &str) -> Result<Vec<ChunkRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT * FROM chunks WHERE bundle_id = ?1 ORDER BY chunk_id")?;
        let rows = stmt
            .query_map(params![bundle_id], Self::row_to_chunk)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn save_custody_record(&self, record: &CustodyRecordRow) -> Result<()> {
        let ranges_json = serde_json::to_string(&record.chunk_ranges)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO custody_records
             (bundle_id, owner_node, chunk_ranges, retry_timer, retry_count, max_retries, state)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.bundle_id,
                record.owner_node,
                ranges_json,
                record.retry_timer,
                record.retry_count,
                record.max_retries,
                record.state,
            ],
        )?;
        Ok(())
    }

    fn load_custody_record(&self, bundle_id: &str) -> Result<Option<CustodyRecordRow>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT * FROM custody_records WHERE bundle_id = ?1",
                params![bundle_id],
                |row| {
                    let ranges_json: String = row.get("chunk_ranges")?;
                    Ok((
                        CustodyRecordRow {
                            bundle_id: row.get("bundle_id")?,
                            owner_node: row.get("owner_node")?,
                            chunk_ranges: Vec::new(),
                            retry_timer: row.get("retry_timer")?,
                            retry_count: row.get("retry_count")?,
                            max_retries: row.get("max_retries")?,
                            state: row.get("state")?,
                            acquired_at: row.get("acquired_at")?,
                        },
                        ranges_json,
                    ))
                },
            )
            .optional()?;

        match row {
            None => Ok(None),
            Some((mut record, ranges_json)) => {
                record.chunk_ranges = serde_json::from_str(&ranges_json)?;
                Ok(Some(record))
            }
        }
    }

    fn delete_bundle(&self, bundle_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM chunks WHERE bundle_id = ?1",
            params![bundle_id],
        )?;
        conn.execute(
            "DELETE FROM custody_records WHERE bundle_id = ?1",
            params![bundle_id],
        )?;
        conn.execute(
            "DELETE FROM bundles WHERE bundle_id = ?1",
            params![bundle_id],
        )?;
        Ok(())
    }

    fn cleanup_expired(&self, now_unix: f64) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT bundle_id FROM bundles
             WHERE (?1 - strftime('%s', created_at)) > ttl",
        )?;
        let expired: Vec<String> = stmt
            .query_map(params![now_unix], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        for bundle_id in &expired {
            conn.execute(
                "DELETE FROM chunks WHERE bundle_id = ?1",
                params![bundle_id],
            )?;
            conn.execute(
                "DELETE FROM custody_records WHERE bundle_id = ?1",
                params![bundle_id],
            )?;
            conn.execute(
                "DELETE FROM bundles WHERE bundle_id = ?1",
                params![bundle_id],
            )?;
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "cleaned up expired bundles");
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_bundle(id: &str) -> BundleRecord {
        BundleRecord {
            bundle_id: id.to_string(),
            src: "node-a".to_string(),
            dst: "node-b".to_string(),
            ttl: 300,
            state: BundleState::Sending.as_str().to_string(),
            total_chunks: 4,
            bytes_sent: 0,
            chunks_retransmitted: 0,
            fec_enabled: false,
            k: 0,
            r: 0,
            created_at: String::new(),
            file_path: "in.bin".to_string(),
            file_size: 64,
        }
    }

    #[test]
    fn save_and_load_bundle_round_trips() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.save_bundle(&sample_bundle("abc123")).unwrap();
        let loaded = store.load_bundle("abc123").unwrap().unwrap();
        assert_eq!(loaded.bundle_id, "abc123");
        assert_eq!(loaded.total_chunks, 4);
    }

    #[test]
    fn load_missing_bundle_is_none() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.load_bundle("nope").unwrap().is_none());
    }

    #[test]
    fn update_state_and_stats() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.save_bundle(&sample_bundle("abc")).unwrap();
        store
            .update_bundle_state("abc", BundleState::Delivered)
            .unwrap();
        store
            .update_bundle_stats("abc", Some(128), Some(2))
            .unwrap();
        let loaded = store.load_bundle("abc").unwrap().unwrap();
        assert_eq!(loaded.state, "delivered");
        assert_eq!(loaded.bytes_sent, 128);
        assert_eq!(loaded.chunks_retransmitted, 2);
    }

    #[test]
    fn bulk_chunk_write_is_atomic_and_ordered() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.save_bundle(&sample_bundle("abc")).unwrap();
        let chunks = vec![
            ChunkRecord {
                bundle_id: "abc".into(),
                chunk_id: 1,
                is_parity: false,
                block_id: 0,
                k: 0,
                r: 0,
                payload: b"b".to_vec(),
                checksum: 2,
                flags: 0,
            },
            ChunkRecord {
                bundle_id: "abc".into(),
                chunk_id: 0,
                is_parity: false,
                block_id: 0,
                k: 0,
                r: 0,
                payload: b"a".to_vec(),
                checksum: 1,
                flags: 0,
            },
        ];
        store.save_chunks_bulk(&chunks).unwrap();
        let loaded = store.load_chunks_for_bundle("abc").unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].chunk_id, 0);
        assert_eq!(loaded[1].chunk_id, 1);
    }

    #[test]
    fn custody_record_round_trips_ranges() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.save_bundle(&sample_bundle("abc")).unwrap();
        let record = CustodyRecordRow {
            bundle_id: "abc".into(),
            owner_node: "hop1".into(),
            chunk_ranges: vec![(0, 10), (20, 30)],
            retry_timer: 123.0,
            retry_count: 0,
            max_retries: 10,
            state: "accepted".into(),
            acquired_at: String::new(),
        };
        store.save_custody_record(&record).unwrap();
        let loaded = store.load_custody_record("abc").unwrap().unwrap();
        assert_eq!(loaded.chunk_ranges, vec![(0, 10), (20, 30)]);
    }

    #[test]
    fn delete_bundle_cascades() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.save_bundle(&sample_bundle("abc")).unwrap();
        store
            .save_chunks_bulk(&[ChunkRecord {
                bundle_id: "abc".into(),
                chunk_id: 0,
                is_parity: false,
                block_id: 0,
                k: 0,
                r: 0,
                payload: b"x".to_vec(),
                checksum: 1,
                flags: 0,
            }])
            .unwrap();
        store.delete_bundle("abc").unwrap();
        assert!(store.load_bundle("abc").unwrap().is_none());
        assert!(store.load_chunks_for_bundle("abc").unwrap().is_empty());
    }

    #[test]
    fn cleanup_expired_removes_old_bundles_only() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.save_bundle(&sample_bundle("fresh")).unwrap();
        store
            .conn
            .lock()
            .unwrap()
            .execute(
                "UPDATE bundles SET created_at = datetime('now', '-1000 seconds') WHERE bundle_id = 'fresh'",
                [],
            )
            .unwrap();

        let mut stale = sample_bundle("stale");
        stale.ttl = 300;
        store.save_bundle(&stale).unwrap();

        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs_f64();
        let expired = store.cleanup_expired(now).unwrap();
        assert_eq!(expired, vec!["fresh".to_string()]);
        assert!(store.load_bundle("fresh").unwrap().is_none());
        assert!(store.load_bundle("stale").unwrap().is_some());
    }
}
