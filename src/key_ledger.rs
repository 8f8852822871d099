//! Key material ledger.
//!
//! Holds one shared-secret buffer per peer and hands out disjoint byte ranges of it.
//! Every entry has its own lock so concurrent senders to the same peer serialize on
//! the cursor, while unrelated peers never contend.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use zeroize::{Zeroize, Zeroizing};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("No key material for peer {0}")]
    NoSuchPeer(String),

    #[error("Key material for peer {peer} already present")]
    AlreadyExists { peer: String },

    #[error("Insufficient key material for {peer}: requested {requested}, remaining {remaining}")]
    InsufficientMaterial {
        peer: String,
        requested: usize,
        remaining: usize,
    },

    #[error("Key material for peer {0} is exhausted")]
    Exhausted(String),

    #[error("Range {offset}+{len} outside key material for peer {peer} ({size} bytes)")]
    OutOfRange {
        peer: String,
        offset: usize,
        len: usize,
        size: usize,
    },
}

/// A range of key bytes handed out by the ledger. The bytes are wiped on drop.
#[derive(Debug)]
pub struct KeySlice {
    pub offset: usize,
    pub bytes: Zeroizing<Vec<u8>>,
}

impl KeySlice {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

struct LedgerEntry {
    buffer: Vec<u8>,
    cursor: usize,
    exhausted: bool,
    initiative: bool,
}

impl LedgerEntry {
    fn remaining(&self) -> usize {
        if self.exhausted {
            0
        } else {
            self.buffer.len() - self.cursor
        }
    }

    fn check_available(&mut self, peer: &str, n: usize) -> Result<(), LedgerError> {
        if self.exhausted {
            return Err(LedgerError::Exhausted(peer.to_string()));
        }
        let remaining = self.buffer.len() - self.cursor;
        if remaining < n {
            self.exhausted = true;
            warn!(
                "🔑 Key material for {} exhausted (requested {}, remaining {})",
                peer, n, remaining
            );
            return Err(LedgerError::InsufficientMaterial {
                peer: peer.to_string(),
                requested: n,
                remaining,
            });
        }
        Ok(())
    }
}

impl Drop for LedgerEntry {
    fn drop(&mut self) {
        self.buffer.zeroize();
    }
}

/// Snapshot of one ledger entry, without the secret bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerStatus {
    pub peer: String,
    pub size: usize,
    pub used: usize,
    pub exhausted: bool,
    pub initiative: bool,
}

/// Per-peer pool of one-time key material.
#[derive(Default)]
pub struct KeyMaterialLedger {
    entries: DashMap<String, Arc<Mutex<LedgerEntry>>>,
}

impl KeyMaterialLedger {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    fn entry(&self, peer: &str) -> Result<Arc<Mutex<LedgerEntry>>, LedgerError> {
        self.entries
            .get(peer)
            .map(|e| e.value().clone())
            .ok_or_else(|| LedgerError::NoSuchPeer(peer.to_string()))
    }

    /// Register key material for a peer. Existing material is never overwritten.
    pub fn insert(&self, peer: &str, buffer: Vec<u8>, initiative: bool) -> Result<(), LedgerError> {
        use dashmap::mapref::entry::Entry;

        match self.entries.entry(peer.to_string()) {
            Entry::Occupied(_) => {
                let mut buffer = buffer;
                buffer.zeroize();
                Err(LedgerError::AlreadyExists {
                    peer: peer.to_string(),
                })
            }
            Entry::Vacant(slot) => {
                info!(
                    "🔑 Stored {} bytes of key material for {} (initiative: {})",
                    buffer.len(),
                    peer,
                    initiative
                );
                slot.insert(Arc::new(Mutex::new(LedgerEntry {
                    buffer,
                    cursor: 0,
                    exhausted: false,
                    initiative,
                })));
                Ok(())
            }
        }
    }

    /// Hand out the next `n` unused bytes and advance the cursor past them in one step.
    ///
    /// If fewer than `n` bytes remain the entry is marked exhausted and serves nothing
    /// afterwards, whatever size later callers ask for.
    pub fn take_next(&self, peer: &str, n: usize) -> Result<KeySlice, LedgerError> {
        let entry = self.entry(peer)?;
        let mut entry = entry.lock();
        entry.check_available(peer, n)?;

        let offset = entry.cursor;
        let bytes = Zeroizing::new(entry.buffer[offset..offset + n].to_vec());
        entry.cursor += n;
        debug!("🔑 Issued key range {}..{} for {}", offset, offset + n, peer);
        Ok(KeySlice { offset, bytes })
    }

    /// Read `n` bytes at `offset` without moving the cursor.
    pub fn take_at(&self, peer: &str, n: usize, offset: usize) -> Result<KeySlice, LedgerError> {
        let entry = self.entry(peer)?;
        let entry = entry.lock();
        if entry.exhausted {
            return Err(LedgerError::Exhausted(peer.to_string()));
        }
        let size = entry.buffer.len();
        let end = offset.checked_add(n).filter(|end| *end <= size).ok_or_else(|| {
            LedgerError::OutOfRange {
                peer: peer.to_string(),
                offset,
                len: n,
                size,
            }
        })?;
        Ok(KeySlice {
            offset,
            bytes: Zeroizing::new(entry.buffer[offset..end].to_vec()),
        })
    }

    /// Read the range a peer used for a message and move the local cursor past it,
    /// so that range is never handed out by `take_next` here.
    pub fn consume_received(
        &self,
        peer: &str,
        n: usize,
        offset: usize,
    ) -> Result<KeySlice, LedgerError> {
        let entry = self.entry(peer)?;
        let mut entry = entry.lock();
        if entry.exhausted {
            return Err(LedgerError::Exhausted(peer.to_string()));
        }
        let size = entry.buffer.len();
        let end = offset.checked_add(n).filter(|end| *end <= size).ok_or_else(|| {
            LedgerError::OutOfRange {
                peer: peer.to_string(),
                offset,
                len: n,
                size,
            }
        })?;
        if end > entry.cursor {
            debug!("🔑 Cursor for {} synced {} -> {}", peer, entry.cursor, end);
            entry.cursor = end;
        }
        Ok(KeySlice {
            offset,
            bytes: Zeroizing::new(entry.buffer[offset..end].to_vec()),
        })
    }

    /// Skip `n` bytes without reading them.
    pub fn advance(&self, peer: &str, n: usize) -> Result<(), LedgerError> {
        let entry = self.entry(peer)?;
        let mut entry = entry.lock();
        entry.check_available(peer, n)?;
        entry.cursor += n;
        Ok(())
    }

    /// Bytes still available for `take_next`. Zero once exhausted.
    pub fn remaining(&self, peer: &str) -> Result<usize, LedgerError> {
        Ok(self.entry(peer)?.lock().remaining())
    }

    pub fn is_exhausted(&self, peer: &str) -> Result<bool, LedgerError> {
        Ok(self.entry(peer)?.lock().exhausted)
    }

    pub fn has_initiative(&self, peer: &str) -> Result<bool, LedgerError> {
        Ok(self.entry(peer)?.lock().initiative)
    }

    pub fn contains(&self, peer: &str) -> bool {
        self.entries.contains_key(peer)
    }

    /// Remove a peer's material entirely. The buffer is wiped when the last
    /// in-flight user releases it.
    pub fn delete(&self, peer: &str) -> Result<(), LedgerError> {
        match self.entries.remove(peer) {
            Some(_) => {
                info!("🔑 Deleted key material for {}", peer);
                Ok(())
            }
            None => Err(LedgerError::NoSuchPeer(peer.to_string())),
        }
    }

    pub fn status(&self, peer: &str) -> Result<LedgerStatus, LedgerError> {
        let entry = self.entry(peer)?;
        let entry = entry.lock();
        Ok(LedgerStatus {
            peer: peer.to_string(),
            size: entry.buffer.len(),
            used: entry.cursor,
            exhausted: entry.exhausted,
            initiative: entry.initiative,
        })
    }

    pub fn peers(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn buffer(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_successive_takes_are_disjoint() {
        let ledger = KeyMaterialLedger::new();
        ledger.insert("bob", buffer(100), true).unwrap();

        let first = ledger.take_next("bob", 32).unwrap();
        assert_eq!(ledger.remaining("bob").unwrap(), 68);
        let second = ledger.take_next("bob", 32).unwrap();
        assert_eq!(ledger.remaining("bob").unwrap(), 36);

        assert_eq!(first.offset, 0);
        assert_eq!(second.offset, 32);
        assert_eq!(&first.bytes[..], &buffer(100)[0..32]);
        assert_eq!(&second.bytes[..], &buffer(100)[32..64]);
    }

    #[test]
    fn test_insufficient_material_exhausts_entry() {
        let ledger = KeyMaterialLedger::new();
        ledger.insert("bob", buffer(40), false).unwrap();
        ledger.take_next("bob", 32).unwrap();

        let err = ledger.take_next("bob", 16).unwrap_err();
        assert_eq!(
            err,
            LedgerError::InsufficientMaterial {
                peer: "bob".to_string(),
                requested: 16,
                remaining: 8,
            }
        );
        assert!(ledger.is_exhausted("bob").unwrap());

        // Smaller requests still fail after exhaustion
        assert_eq!(
            ledger.take_next("bob", 1).unwrap_err(),
            LedgerError::Exhausted("bob".to_string())
        );
        assert_eq!(ledger.remaining("bob").unwrap(), 0);
        assert!(ledger.advance("bob", 1).is_err());
        assert!(ledger.take_at("bob", 1, 0).is_err());
    }

    #[test]
    fn test_unknown_peer() {
        let ledger = KeyMaterialLedger::new();
        assert_eq!(
            ledger.take_next("nobody", 1).unwrap_err(),
            LedgerError::NoSuchPeer("nobody".to_string())
        );
        assert!(ledger.remaining("nobody").is_err());
        assert!(ledger.delete("nobody").is_err());
    }

    #[test]
    fn test_insert_never_overwrites() {
        let ledger = KeyMaterialLedger::new();
        ledger.insert("bob", buffer(10), true).unwrap();
        ledger.take_next("bob", 4).unwrap();

        assert!(matches!(
            ledger.insert("bob", buffer(50), true),
            Err(LedgerError::AlreadyExists { .. })
        ));
        assert_eq!(ledger.remaining("bob").unwrap(), 6);

        ledger.delete("bob").unwrap();
        assert!(!ledger.contains("bob"));
        ledger.insert("bob", buffer(50), false).unwrap();
        assert_eq!(ledger.remaining("bob").unwrap(), 50);
    }

    #[test]
    fn test_take_at_does_not_move_cursor() {
        let ledger = KeyMaterialLedger::new();
        ledger.insert("bob", buffer(64), true).unwrap();

        let slice = ledger.take_at("bob", 8, 16).unwrap();
        assert_eq!(&slice.bytes[..], &buffer(64)[16..24]);
        assert_eq!(ledger.remaining("bob").unwrap(), 64);

        assert!(matches!(
            ledger.take_at("bob", 8, 60),
            Err(LedgerError::OutOfRange { .. })
        ));
        assert!(matches!(
            ledger.take_at("bob", 1, usize::MAX),
            Err(LedgerError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_consume_received_syncs_cursor() {
        let ledger = KeyMaterialLedger::new();
        ledger.insert("alice", buffer(64), false).unwrap();

        let slice = ledger.consume_received("alice", 16, 0).unwrap();
        assert_eq!(slice.offset, 0);
        assert_eq!(ledger.remaining("alice").unwrap(), 48);

        // An older range never moves the cursor backwards
        ledger.consume_received("alice", 8, 0).unwrap();
        assert_eq!(ledger.status("alice").unwrap().used, 16);

        let next = ledger.take_next("alice", 16).unwrap();
        assert_eq!(next.offset, 16);
    }

    #[test]
    fn test_advance_skips_bytes() {
        let ledger = KeyMaterialLedger::new();
        ledger.insert("bob", buffer(20), true).unwrap();
        ledger.advance("bob", 5).unwrap();
        assert_eq!(ledger.take_next("bob", 5).unwrap().offset, 5);
        assert_eq!(ledger.remaining("bob").unwrap(), 10);
    }

    #[test]
    fn test_concurrent_takes_never_overlap() {
        let ledger = Arc::new(KeyMaterialLedger::new());
        ledger.insert("bob", buffer(8 * 1000), true).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = ledger.clone();
                std::thread::spawn(move || {
                    let mut offsets = Vec::new();
                    while let Ok(slice) = ledger.take_next("bob", 8) {
                        offsets.push(slice.offset);
                    }
                    offsets
                })
            })
            .collect();

        let mut seen = HashSet::new();
        let mut total = 0;
        for handle in handles {
            for offset in handle.join().unwrap() {
                assert!(seen.insert(offset), "offset {} issued twice", offset);
                total += 1;
            }
        }
        assert_eq!(total, 1000);
        assert!(ledger.is_exhausted("bob").unwrap());
    }
}
