//! Persistence of observed file state.
//!
//! [`DigestStore`] is the cross-run record: one SQLite row per path,
//! holding the digest and size observed when the path was last produced
//! or verified. [`FingerprintCache`] is the in-run memo: it makes sure a
//! path referenced by several tasks is read and hashed at most once per
//! [`Controller`](crate::Controller) instance.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::sync::{Arc, Mutex};

use camino::{Utf8Path, Utf8PathBuf};
use rusqlite::{Connection, OptionalExtension, params};

use crate::core::{Fingerprint, Hash32};
use crate::error::StoreError;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS fingerprints (
    name   TEXT PRIMARY KEY,
    digest TEXT NOT NULL,
    size   INTEGER NOT NULL
) STRICT;
";

/// Persistent path → (digest, size) table, shared by every run against
/// the same database file.
///
/// Rows are written only after a task has successfully produced its
/// targets, and are never proactively deleted; a missing row reads as
/// "never observed", which forces staleness.
pub struct DigestStore {
    conn: Mutex<Connection>,
}

impl DigestStore {
    /// Opens (creating if needed) the store at the given path.
    pub fn open(path: impl AsRef<Utf8Path>) -> Result<Self, StoreError> {
        Self::init(Connection::open(path.as_ref().as_std_path())?)
    }

    /// An ephemeral store for tests and throwaway runs.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Reads the recorded state for a path. A row with an unreadable
    /// digest counts as absent, which safely forces a re-run.
    pub fn get(&self, path: &Utf8Path) -> Result<Option<Fingerprint>, StoreError> {
        let conn = self.conn.lock().unwrap();

        let row = conn
            .query_row(
                "SELECT digest, size FROM fingerprints WHERE name = ?1",
                params![path.as_str()],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()?;

        Ok(row.and_then(|(digest, size)| {
            Some(Fingerprint {
                digest: Hash32::from_hex(&digest)?,
                size: size as u64,
            })
        }))
    }

    /// Inserts or atomically replaces the row for a path.
    pub fn upsert(&self, path: &Utf8Path, fingerprint: &Fingerprint) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();

        conn.execute(
            "INSERT INTO fingerprints (name, digest, size) VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO UPDATE SET digest = excluded.digest, size = excluded.size",
            params![
                path.as_str(),
                fingerprint.digest.to_hex(),
                fingerprint.size as i64
            ],
        )?;

        Ok(())
    }
}

/// One memo slot per path. The outer map hands out slots; the per-path
/// mutex makes concurrent workers asking for the same path wait for the
/// first computation instead of duplicating it.
type CacheSlot = Arc<Mutex<Option<Fingerprint>>>;

/// In-run `path -> Fingerprint` memo, scoped to one Controller instance.
///
/// Read errors are not cached; a failed evaluation is retried on the
/// next request.
#[derive(Default)]
pub(crate) struct FingerprintCache {
    slots: Mutex<HashMap<Utf8PathBuf, CacheSlot>>,
}

impl FingerprintCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, path: &Utf8Path) -> CacheSlot {
        let mut slots = self.slots.lock().unwrap();
        slots.entry(path.to_owned()).or_default().clone()
    }

    /// Returns the memoized fingerprint, computing it on first request.
    pub fn evaluate(&self, path: &Utf8Path) -> io::Result<Fingerprint> {
        let slot = self.slot(path);
        let mut slot = slot.lock().unwrap();

        if let Some(fingerprint) = *slot {
            return Ok(fingerprint);
        }

        let fingerprint = Fingerprint::of_file(path)?;
        *slot = Some(fingerprint);

        Ok(fingerprint)
    }

    /// Recomputes the fingerprint, replacing any memoized value. Used
    /// after a task rewrites one of its targets, so downstream reads of
    /// the same path observe the fresh contents.
    pub fn refresh(&self, path: &Utf8Path) -> io::Result<Fingerprint> {
        let slot = self.slot(path);
        let mut slot = slot.lock().unwrap();

        let fingerprint = Fingerprint::of_file(path)?;
        *slot = Some(fingerprint);

        Ok(fingerprint)
    }

    /// The live byte size of a path. Answered from the memo when one
    /// exists; otherwise a plain metadata call, deliberately without
    /// hashing, so a size mismatch can prove staleness cheaply.
    pub fn size_of(&self, path: &Utf8Path) -> io::Result<u64> {
        let slot = { self.slots.lock().unwrap().get(path).cloned() };

        if let Some(slot) = slot
            && let Some(fingerprint) = *slot.lock().unwrap()
        {
            return Ok(fingerprint.size);
        }

        Ok(fs::metadata(path)?.len())
    }
}
