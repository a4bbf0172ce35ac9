//! An ordered, transactional key-value database.
//!
//! All reads within a [Transaction] observe the database as of when the transaction was opened
//! plus the transaction's own uncommitted writes. Writes are buffered until [Transaction::commit].
//!
//! Three kinds of transactions exist:
//! - [Database::read_transaction]: rejects writes.
//! - [Database::serialized_transaction]: fails to commit with [Error::Conflict] if any other
//!   transaction committed after it was opened.
//! - [Database::unserialized_transaction]: always commits (last writer wins per key). Used for
//!   bookkeeping records that are only ever written by one actor.
//!
//! # Example
//!
//! ```rust
//! use bytes::Bytes;
//! use ocr_storage::kv::{Database, Error};
//!
//! let db = Database::new();
//! let mut first = db.serialized_transaction();
//! let mut second = db.serialized_transaction();
//! first.put(b"a".to_vec(), Bytes::from_static(b"1")).unwrap();
//! second.put(b"b".to_vec(), Bytes::from_static(b"2")).unwrap();
//! first.commit().unwrap();
//! assert!(matches!(second.commit(), Err(Error::Conflict { .. })));
//! ```

use bytes::Bytes;
use std::{
    collections::BTreeMap,
    iter::Peekable,
    ops::Bound,
    sync::{Arc, RwLock},
};
use thiserror::Error;

/// Errors that can occur when interacting with the database.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("write attempted in read-only transaction")]
    ReadOnly,
    #[error("conflict: opened at {opened_at}, database at {current}")]
    Conflict { opened_at: u64, current: u64 },
    #[error("database lock poisoned")]
    Poisoned,
    #[error("corrupt record: {0}")]
    Corrupt(&'static str),
}

#[derive(Default)]
struct Inner {
    data: BTreeMap<Vec<u8>, Bytes>,

    // Incremented on every commit that writes at least one key
    timestamp: u64,
}

/// Handle to a shared in-memory database.
///
/// Cloning the handle is cheap and every clone refers to the same data.
#[derive(Clone, Default)]
pub struct Database {
    inner: Arc<RwLock<Inner>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    Read,
    Serialized,
    Unserialized,
}

impl Database {
    pub fn new() -> Self {
        Self::default()
    }

    fn open(&self, mode: Mode) -> Transaction {
        let opened_at = self.inner.read().map(|inner| inner.timestamp).unwrap_or(0);
        Transaction {
            db: self.clone(),
            mode,
            opened_at,
            writes: BTreeMap::new(),
        }
    }

    /// Open a transaction that only reads.
    pub fn read_transaction(&self) -> Transaction {
        self.open(Mode::Read)
    }

    /// Open a transaction that conflicts with any concurrent commit.
    pub fn serialized_transaction(&self) -> Transaction {
        self.open(Mode::Serialized)
    }

    /// Open a transaction that never conflicts.
    pub fn unserialized_transaction(&self) -> Transaction {
        self.open(Mode::Unserialized)
    }

    /// Number of keys stored.
    pub fn len(&self) -> Result<usize, Error> {
        let inner = self.inner.read().map_err(|_| Error::Poisoned)?;
        Ok(inner.data.len())
    }

    pub fn is_empty(&self) -> Result<bool, Error> {
        Ok(self.len()? == 0)
    }
}

/// A set of reads and buffered writes against a [Database].
pub struct Transaction {
    db: Database,
    mode: Mode,
    opened_at: u64,

    // `None` marks a deletion
    writes: BTreeMap<Vec<u8>, Option<Bytes>>,
}

impl Transaction {
    /// Get the value of `key`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>, Error> {
        if let Some(value) = self.writes.get(key) {
            return Ok(value.clone());
        }
        let inner = self.db.inner.read().map_err(|_| Error::Poisoned)?;
        Ok(inner.data.get(key).cloned())
    }

    /// Set `key` to `value`.
    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: Bytes) -> Result<(), Error> {
        if self.mode == Mode::Read {
            return Err(Error::ReadOnly);
        }
        self.writes.insert(key.into(), Some(value));
        Ok(())
    }

    /// Remove `key` (a no-op if absent).
    pub fn delete(&mut self, key: &[u8]) -> Result<(), Error> {
        if self.mode == Mode::Read {
            return Err(Error::ReadOnly);
        }
        self.writes.insert(key.to_vec(), None);
        Ok(())
    }

    /// Return up to `limit` entries with keys in `[start, end)` in ascending key order.
    ///
    /// An `end` of `None` scans to the last key.
    pub fn range(
        &self,
        start: &[u8],
        end: Option<&[u8]>,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Bytes)>, Error> {
        let upper = match end {
            Some(end) => Bound::Excluded(end.to_vec()),
            None => Bound::Unbounded,
        };
        let bounds = (Bound::Included(start.to_vec()), upper);

        let inner = self.db.inner.read().map_err(|_| Error::Poisoned)?;
        let base = inner
            .data
            .range(bounds.clone())
            .map(|(k, v)| (k, Some(v)))
            .peekable();
        let overlay = self
            .writes
            .range(bounds)
            .map(|(k, v)| (k, v.as_ref()))
            .peekable();
        Ok(merge(base, overlay, limit))
    }

    /// Return up to `limit` entries whose keys start with `prefix`.
    pub fn scan_prefix(&self, prefix: &[u8], limit: usize) -> Result<Vec<(Vec<u8>, Bytes)>, Error> {
        let end = prefix_end(prefix);
        self.range(prefix, end.as_deref(), limit)
    }

    /// Delete every key that starts with `prefix`, returning the number of keys removed.
    pub fn delete_prefix(&mut self, prefix: &[u8]) -> Result<usize, Error> {
        let keys: Vec<Vec<u8>> = self
            .scan_prefix(prefix, usize::MAX)?
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        for key in keys.iter() {
            self.delete(key)?;
        }
        Ok(keys.len())
    }

    /// Apply all buffered writes atomically.
    pub fn commit(self) -> Result<(), Error> {
        if self.writes.is_empty() {
            return Ok(());
        }
        let mut inner = self.db.inner.write().map_err(|_| Error::Poisoned)?;
        if self.mode == Mode::Serialized && inner.timestamp != self.opened_at {
            return Err(Error::Conflict {
                opened_at: self.opened_at,
                current: inner.timestamp,
            });
        }
        for (key, value) in self.writes {
            match value {
                Some(value) => {
                    inner.data.insert(key, value);
                }
                None => {
                    inner.data.remove(&key);
                }
            }
        }
        inner.timestamp += 1;
        Ok(())
    }

    /// Drop all buffered writes.
    pub fn discard(self) {}
}

/// Merge committed entries with a transaction's overlay (overlay wins, `None` hides the key).
fn merge<'a, B, O>(
    mut base: Peekable<B>,
    mut overlay: Peekable<O>,
    limit: usize,
) -> Vec<(Vec<u8>, Bytes)>
where
    B: Iterator<Item = (&'a Vec<u8>, Option<&'a Bytes>)>,
    O: Iterator<Item = (&'a Vec<u8>, Option<&'a Bytes>)>,
{
    let mut out = Vec::new();
    while out.len() < limit {
        let next = match (base.peek(), overlay.peek()) {
            (None, None) => break,
            (Some(_), None) => base.next(),
            (None, Some(_)) => overlay.next(),
            (Some((b, _)), Some((o, _))) => {
                if b < o {
                    base.next()
                } else {
                    if b == o {
                        base.next();
                    }
                    overlay.next()
                }
            }
        };
        if let Some((key, Some(value))) = next {
            out.push((key.clone(), value.clone()));
        }
    }
    out
}

/// The smallest key greater than every key starting with `prefix`.
///
/// Returns `None` if no such key exists (the prefix is empty or all `0xff`).
pub fn prefix_end(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return Some(end);
        }
    }
    None
}
