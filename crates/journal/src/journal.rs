//! Append-only action journal using sled

use crate::Result;
use anyhow::Context;
use chrono::{DateTime, Utc};
use fanwatch_core::Action;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sled::Db;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};
use ulid::{Generator, Ulid};

/// An archived action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Unique ID, ordered by append time
    pub id: Ulid,
    pub action: Action,
}

impl JournalEntry {
    fn serialize(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).context("Failed to encode journal entry")
    }

    fn deserialize(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).context("Failed to decode journal entry")
    }

    /// When the entry was appended
    pub fn appended_at(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from(self.id.datetime())
    }
}

/// Append-only journal of actions
pub struct ActionJournal {
    /// Sled database
    db: Db,
    /// In-memory index: entry id -> sequence number
    index: RwLock<BTreeMap<Ulid, u64>>,
    /// Monotonic sequence counter
    seq_counter: AtomicU64,
    /// Monotonic ID source
    ids: Mutex<Generator>,
}

impl ActionJournal {
    /// Open or create a journal in `dir`
    pub fn open(dir: &Path) -> Result<Self> {
        let db_path = dir.join("actions.db");
        let db = sled::open(&db_path)
            .with_context(|| format!("Failed to open journal at {}", db_path.display()))?;

        // Build in-memory index on startup
        let mut index = BTreeMap::new();
        let mut max_seq = 0u64;

        for item in db.iter() {
            let (key, value) = item?;
            let seq = decode_key(&key)?;
            let entry = JournalEntry::deserialize(&value)?;
            index.insert(entry.id, seq);
            max_seq = max_seq.max(seq);
        }

        info!(path = %db_path.display(), entries = index.len(), "Opened action journal");

        Ok(Self {
            db,
            index: RwLock::new(index),
            seq_counter: AtomicU64::new(max_seq + 1),
            ids: Mutex::new(Generator::new()),
        })
    }

    /// Append an action, returning its entry id
    pub fn append(&self, action: &Action) -> Result<Ulid> {
        let id = self
            .ids
            .lock()
            .generate()
            .context("Journal id space exhausted for this millisecond")?;
        let entry = JournalEntry {
            id,
            action: action.clone(),
        };

        let seq = self.seq_counter.fetch_add(1, Ordering::SeqCst);
        self.db.insert(seq.to_be_bytes(), entry.serialize()?)?;

        // Update index
        self.index.write().insert(id, seq);

        debug!(id = %id, seq, kind = %action.kind, "Journaled action");
        Ok(id)
    }

    /// Make appended entries durable
    pub fn flush(&self) -> Result<()> {
        self.db.flush().context("Failed to flush journal")?;
        Ok(())
    }

    /// Get an entry by ID
    pub fn get(&self, id: &Ulid) -> Result<Option<JournalEntry>> {
        let seq = match self.index.read().get(id) {
            Some(&seq) => seq,
            None => return Ok(None),
        };
        self.load(seq)
    }

    /// Most recent entry
    pub fn latest(&self) -> Result<Option<JournalEntry>> {
        let max_seq = self.index.read().values().max().copied();
        match max_seq {
            Some(seq) => self.load(seq),
            None => Ok(None),
        }
    }

    /// Last `count` entries, oldest first
    pub fn last_n(&self, count: usize) -> Result<Vec<JournalEntry>> {
        let seqs = self.sorted_seqs();
        let start_idx = seqs.len().saturating_sub(count);
        self.load_all(&seqs[start_idx..])
    }

    /// Entries appended at or after `since`, oldest first
    pub fn since(&self, since: DateTime<Utc>) -> Result<Vec<JournalEntry>> {
        let since_ms = since.timestamp_millis().max(0) as u64;

        let mut seqs: Vec<u64> = self
            .index
            .read()
            .iter()
            .filter(|(id, _)| id.timestamp_ms() >= since_ms)
            .map(|(_, &seq)| seq)
            .collect();
        seqs.sort_unstable();

        self.load_all(&seqs)
    }

    /// All entry IDs, oldest first
    pub fn ids(&self) -> Vec<Ulid> {
        let index = self.index.read();
        let mut ids: Vec<(u64, Ulid)> = index.iter().map(|(&id, &seq)| (seq, id)).collect();
        ids.sort_unstable();
        ids.into_iter().map(|(_, id)| id).collect()
    }

    /// Delete an entry
    pub fn delete(&self, id: &Ulid) -> Result<()> {
        let seq = match self.index.write().remove(id) {
            Some(seq) => seq,
            None => return Ok(()), // Already deleted
        };

        self.db.remove(seq.to_be_bytes())?;
        Ok(())
    }

    /// Get the total number of entries
    pub fn count(&self) -> usize {
        self.index.read().len()
    }

    fn sorted_seqs(&self) -> Vec<u64> {
        let mut seqs: Vec<u64> = self.index.read().values().copied().collect();
        seqs.sort_unstable();
        seqs
    }

    fn load(&self, seq: u64) -> Result<Option<JournalEntry>> {
        match self.db.get(seq.to_be_bytes())? {
            Some(value) => Ok(Some(JournalEntry::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    fn load_all(&self, seqs: &[u64]) -> Result<Vec<JournalEntry>> {
        let mut entries = Vec::with_capacity(seqs.len());
        for &seq in seqs {
            if let Some(entry) = self.load(seq)? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }
}

fn decode_key(key: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = key
        .try_into()
        .with_context(|| format!("Corrupt journal key of {} bytes", key.len()))?;
    Ok(u64::from_be_bytes(bytes))
}
