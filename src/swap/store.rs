use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension as _, params};
use serde::Deserialize;

use super::{ChainSwap, ReverseSwap, SubmarineSwap, Swap, SwapCommon, SwapStatus, SwapType};
use crate::api::{LegDetails, StatusUpdate};
use crate::error::{Error, Result};
use crate::keys::KeyStore;

pub const SCHEMA_VERSION: i64 = 2;

const MNEMONIC_KEY: &str = "mnemonic";
const NEXT_INDEX_KEY: &str = "next_key_index";

#[derive(Debug)]
pub struct SqliteSwapStore {
    conn: Connection,
    path: Option<PathBuf>,
}

impl SqliteSwapStore {
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            std::fs::create_dir_all(dir)?;
        }

        let conn = Connection::open(&path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;

        let mut store = Self {
            conn,
            path: Some(path),
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        let mut store = Self {
            conn: Connection::open_in_memory()?,
            path: None,
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn migrate(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
CREATE TABLE IF NOT EXISTS swaps (
  swap_id TEXT PRIMARY KEY,
  swap_type TEXT NOT NULL,
  status TEXT NOT NULL,
  created_at INTEGER NOT NULL,
  schema_version INTEGER NOT NULL,
  body TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS swaps_status_idx ON swaps(status);
CREATE TABLE IF NOT EXISTS settings (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL
);
"#,
        )?;

        let legacy: Vec<(String, String)> = {
            let mut stmt = self
                .conn
                .prepare("SELECT swap_id, body FROM swaps WHERE schema_version < ?1")?;
            let rows = stmt.query_map(params![SCHEMA_VERSION], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        if legacy.is_empty() {
            return Ok(());
        }

        let tx = self.conn.transaction()?;
        for (swap_id, body) in &legacy {
            let swap = serde_json::from_str::<LegacySwapV1>(body)
                .map_err(Error::from)
                .and_then(LegacySwapV1::upgrade)
                .map_err(|e| Error::Config(format!("migrate swap {swap_id}: {e}")))?;
            tx.execute(
                r#"
UPDATE swaps
SET swap_type = ?2, status = ?3, created_at = ?4, schema_version = ?5, body = ?6
WHERE swap_id = ?1
"#,
                params![
                    swap_id,
                    swap.swap_type().as_str(),
                    swap.status().as_str(),
                    swap.common().date,
                    SCHEMA_VERSION,
                    serde_json::to_string(&swap)?,
                ],
            )?;
        }
        tx.commit()?;
        tracing::info!(migrated = legacy.len(), "migrated swap records to schema v2");
        Ok(())
    }

    pub fn insert_swap(&mut self, swap: &Swap) -> Result<()> {
        self.conn.execute(
            r#"
INSERT INTO swaps (swap_id, swap_type, status, created_at, schema_version, body)
VALUES (?1, ?2, ?3, ?4, ?5, ?6)
"#,
            params![
                swap.id(),
                swap.swap_type().as_str(),
                swap.status().as_str(),
                swap.common().date,
                SCHEMA_VERSION,
                serde_json::to_string(swap)?,
            ],
        )?;
        Ok(())
    }

    pub fn get_swap(&self, swap_id: &str) -> Result<Option<Swap>> {
        let body: Option<String> = self
            .conn
            .query_row(
                "SELECT body FROM swaps WHERE swap_id = ?1",
                params![swap_id],
                |row| row.get(0),
            )
            .optional()?;
        body.map(|b| serde_json::from_str(&b).map_err(Error::from))
            .transpose()
    }

    pub fn put_swap(&mut self, swap: &Swap) -> Result<()> {
        let rows = self.conn.execute(
            "UPDATE swaps SET status = ?2, body = ?3 WHERE swap_id = ?1",
            params![swap.id(), swap.status().as_str(), serde_json::to_string(swap)?],
        )?;
        if rows != 1 {
            return Err(Error::SwapNotFound(swap.id().to_string()));
        }
        Ok(())
    }

    pub fn list_swaps(&self) -> Result<Vec<Swap>> {
        let mut stmt = self
            .conn
            .prepare("SELECT body FROM swaps ORDER BY created_at, swap_id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut out = Vec::new();
        for row in rows {
            out.push(serde_json::from_str(&row?)?);
        }
        Ok(out)
    }

    fn setting(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn set_setting(&mut self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }
}

/// Shared handle. Every read-modify-write runs under one lock, so updates to
/// the same record are serialized.
#[derive(Debug, Clone)]
pub struct SwapStore {
    inner: Arc<Mutex<SqliteSwapStore>>,
}

impl SwapStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self::from_sqlite(SqliteSwapStore::open(path.into())?))
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self::from_sqlite(SqliteSwapStore::in_memory()?))
    }

    fn from_sqlite(store: SqliteSwapStore) -> Self {
        Self {
            inner: Arc::new(Mutex::new(store)),
        }
    }

    pub fn insert(&self, swap: &Swap) -> Result<()> {
        let mut store = self.inner.lock().expect("store mutex poisoned");
        store.insert_swap(swap)?;
        tracing::debug!(swap_id = %swap.id(), swap_type = swap.swap_type().as_str(), "swap stored");
        Ok(())
    }

    pub fn get(&self, swap_id: &str) -> Result<Option<Swap>> {
        self.inner
            .lock()
            .expect("store mutex poisoned")
            .get_swap(swap_id)
    }

    pub fn require(&self, swap_id: &str) -> Result<Swap> {
        self.get(swap_id)?
            .ok_or_else(|| Error::SwapNotFound(swap_id.to_string()))
    }

    pub fn list(&self) -> Result<Vec<Swap>> {
        self.inner.lock().expect("store mutex poisoned").list_swaps()
    }

    pub fn pending(&self) -> Result<Vec<Swap>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|s| s.status().is_pending())
            .collect())
    }

    /// Runs `f` on the stored record and writes the result back.
    pub fn update<T>(&self, swap_id: &str, f: impl FnOnce(&mut Swap) -> T) -> Result<(Swap, T)> {
        let mut store = self.inner.lock().expect("store mutex poisoned");
        let mut swap = store
            .get_swap(swap_id)?
            .ok_or_else(|| Error::SwapNotFound(swap_id.to_string()))?;
        let out = f(&mut swap);
        store.put_swap(&swap)?;
        Ok((swap, out))
    }

    /// Merges a batch of status reports in one transaction. Unknown ids are
    /// skipped. Returns the records whose status changed.
    pub fn apply_status_updates(&self, updates: &[StatusUpdate]) -> Result<Vec<Swap>> {
        let mut store = self.inner.lock().expect("store mutex poisoned");
        let tx = store.conn.transaction()?;
        let mut changed = Vec::new();
        for update in updates {
            let body: Option<String> = tx
                .query_row(
                    "SELECT body FROM swaps WHERE swap_id = ?1",
                    params![update.id],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(body) = body else {
                tracing::debug!(swap_id = %update.id, "status update for unknown swap");
                continue;
            };
            let mut swap: Swap = serde_json::from_str(&body)?;
            let before = swap.status();
            if !swap.apply_status(update.status) {
                continue;
            }
            tx.execute(
                "UPDATE swaps SET status = ?2, body = ?3 WHERE swap_id = ?1",
                params![
                    update.id,
                    swap.status().as_str(),
                    serde_json::to_string(&swap)?
                ],
            )?;
            tracing::info!(
                swap_id = %update.id,
                from = %before,
                to = %swap.status(),
                "swap status updated"
            );
            changed.push(swap);
        }
        tx.commit()?;
        Ok(changed)
    }
}

impl KeyStore for SwapStore {
    fn mnemonic(&self) -> Result<Option<String>> {
        self.inner
            .lock()
            .expect("store mutex poisoned")
            .setting(MNEMONIC_KEY)
    }

    fn set_mnemonic(&self, mnemonic: &str) -> Result<()> {
        self.inner
            .lock()
            .expect("store mutex poisoned")
            .set_setting(MNEMONIC_KEY, mnemonic)
    }

    fn next_index(&self) -> Result<u32> {
        let mut store = self.inner.lock().expect("store mutex poisoned");
        let index = match store.setting(NEXT_INDEX_KEY)? {
            Some(raw) => raw
                .parse::<u32>()
                .map_err(|e| Error::Config(format!("stored key index {raw:?}: {e}")))?,
            None => 0,
        };
        let next = index
            .checked_add(1)
            .ok_or_else(|| Error::KeyDerivation("key index space exhausted".into()))?;
        store.set_setting(NEXT_INDEX_KEY, &next.to_string())?;
        Ok(index)
    }
}

/// Flat record layout used before typed legs: millisecond dates, the
/// preimage stored inline and legs in coordinator wire shape.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacySwapV1 {
    id: String,
    #[serde(rename = "type")]
    swap_type: SwapType,
    status: String,
    asset_send: String,
    asset_receive: String,
    send_amount: u64,
    receive_amount: u64,
    date: i64,
    preimage_hash: String,
    key_index: u32,
    #[serde(default)]
    preimage: Option<String>,
    #[serde(default)]
    claim_tx: Option<String>,
    #[serde(default)]
    refund_tx: Option<String>,
    #[serde(default)]
    lockup_tx: Option<String>,
    #[serde(default)]
    chain_id: Option<u64>,
    #[serde(default)]
    invoice: Option<String>,
    #[serde(default)]
    claim_address: Option<String>,
    #[serde(default)]
    lockup: Option<LegDetails>,
    #[serde(default)]
    claim_details: Option<LegDetails>,
    #[serde(default)]
    lockup_details: Option<LegDetails>,
}

impl LegacySwapV1 {
    fn upgrade(self) -> Result<Swap> {
        // Unknown legacy statuses become swap.created so the next sync
        // reconciles them against the coordinator.
        let status = self.status.parse().unwrap_or_else(|_| {
            tracing::warn!(swap_id = %self.id, status = %self.status, "unknown legacy status");
            SwapStatus::SwapCreated
        });
        let common = SwapCommon {
            id: self.id.clone(),
            status,
            asset_send: self.asset_send,
            asset_receive: self.asset_receive,
            send_amount: self.send_amount,
            receive_amount: self.receive_amount,
            date: self.date / 1000,
            preimage_hash: self.preimage_hash,
            key_index: self.key_index,
            random_preimage: self.preimage,
            claim_tx: self.claim_tx,
            refund_tx: self.refund_tx,
            lockup_tx: self.lockup_tx,
            chain_id: self.chain_id,
        };
        let missing = |field: &str| Error::InvalidResponse(format!("legacy swap {}: missing {field}", self.id));

        Ok(match self.swap_type {
            SwapType::Submarine => Swap::Submarine(SubmarineSwap {
                common,
                invoice: self.invoice.ok_or_else(|| missing("invoice"))?,
                lockup: self.lockup.ok_or_else(|| missing("lockup"))?.into_leg("lockup")?,
            }),
            SwapType::Reverse => Swap::Reverse(ReverseSwap {
                common,
                invoice: self.invoice.ok_or_else(|| missing("invoice"))?,
                claim_address: self.claim_address.ok_or_else(|| missing("claimAddress"))?,
                lockup: self.lockup.ok_or_else(|| missing("lockup"))?.into_leg("lockup")?,
            }),
            SwapType::Chain => Swap::Chain(ChainSwap {
                common,
                claim_address: self.claim_address.ok_or_else(|| missing("claimAddress"))?,
                claim_details: self
                    .claim_details
                    .ok_or_else(|| missing("claimDetails"))?
                    .into_leg("claimDetails")?,
                lockup_details: self
                    .lockup_details
                    .ok_or_else(|| missing("lockupDetails"))?
                    .into_leg("lockupDetails")?,
            }),
        })
    }
}
