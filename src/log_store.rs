//! Bounded, per-subscription delivery history.
//!
//! Every subscription owns its own slot guarded by its own mutex, so the
//! insert-then-evict sequence is atomic for that subscription while appends
//! for different subscriptions proceed in parallel. The outer map lock is
//! only held long enough to find or create a slot.
//!
//! Removing a subscription retires its slot. A delivery that was still in
//! flight at that point finds the slot retired and is dropped instead of
//! bringing the history (and its file) back.

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

use crate::config::RETENTION_LIMIT;
use crate::error::LogStoreError;
use crate::types::{DeliveryLogEntry, NewDelivery};

#[derive(Default)]
struct History {
    entries: Vec<DeliveryLogEntry>,
    retired: bool,
}

type Slot = Arc<Mutex<History>>;

#[derive(Default)]
struct Slots {
    live: HashMap<u64, Slot>,
    retired: HashSet<u64>,
}

pub struct DeliveryLog {
    slots: Mutex<Slots>,
    next_id: AtomicU64,
    limit: usize,
    data_dir: Option<PathBuf>,
}

impl DeliveryLog {
    pub fn new(data_dir: Option<PathBuf>) -> Self {
        Self::with_limit(RETENTION_LIMIT, data_dir)
    }

    pub fn with_limit(limit: usize, data_dir: Option<PathBuf>) -> Self {
        Self {
            slots: Mutex::new(Slots::default()),
            next_id: AtomicU64::new(1),
            limit: limit.max(1),
            data_dir,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Restore persisted entries from `<data_dir>/deliveries` for the
    /// subscriptions `known` accepts. Files of unknown subscriptions are
    /// stale and get deleted. Returns the number of subscriptions loaded.
    pub fn load(&self, known: impl Fn(u64) -> bool) -> Result<usize, LogStoreError> {
        let Some(dir) = self.deliveries_dir() else {
            return Ok(0);
        };
        if !dir.exists() {
            return Ok(0);
        }

        let read_dir = std::fs::read_dir(&dir).map_err(|source| LogStoreError::Io {
            action: "read",
            path: dir.display().to_string(),
            source,
        })?;

        let mut loaded = 0;
        let mut max_id = 0;
        for item in read_dir.flatten() {
            let path = item.path();
            let Some(subscription_id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u64>().ok())
            else {
                continue;
            };
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if !known(subscription_id) {
                tracing::warn!(subscription_id, "discarding delivery log of unknown subscription");
                if let Err(e) = remove_file(&path) {
                    tracing::error!(subscription_id, error = %e, "failed to remove stale delivery log");
                }
                continue;
            }

            let mut entries = read_entries(&path)?;
            entries.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
            let excess = entries.len().saturating_sub(self.limit);
            entries.drain(..excess);
            max_id = entries.iter().map(|e| e.id).fold(max_id, u64::max);

            self.lock_slots().live.insert(
                subscription_id,
                Arc::new(Mutex::new(History {
                    entries,
                    retired: false,
                })),
            );
            loaded += 1;
        }

        self.next_id.fetch_max(max_id + 1, Ordering::SeqCst);
        tracing::info!(subscriptions = loaded, "delivery log loaded");
        Ok(loaded)
    }

    /// Insert one entry and evict the oldest ones beyond the retention limit.
    ///
    /// A failure to persist is logged; the in-memory log is still updated.
    /// Returns `None` when the subscription was removed in the meantime.
    pub fn append(&self, delivery: NewDelivery) -> Option<DeliveryLogEntry> {
        let subscription_id = delivery.subscription_id;
        let Some(slot) = self.slot(subscription_id) else {
            tracing::debug!(subscription_id, "subscription removed, delivery not logged");
            return None;
        };
        let mut history = lock(&slot);
        if history.retired {
            tracing::debug!(subscription_id, "subscription removed, delivery not logged");
            return None;
        }
        let entries = &mut history.entries;

        // Keep created_at non-decreasing within a subscription even if the
        // wall clock steps backwards.
        let now = Utc::now();
        let created_at = match entries.last() {
            Some(last) if last.created_at > now => last.created_at,
            _ => now,
        };

        let entry = DeliveryLogEntry {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            delivery_id: Uuid::new_v4(),
            subscription_id,
            created_at,
            trigger_kind: delivery.trigger_kind,
            request_url: delivery.request_url,
            request_body: delivery.request_body,
            request_headers: delivery.request_headers,
            response_status: delivery.response_status,
            response_body: delivery.response_body,
            response_headers: delivery.response_headers,
        };

        entries.push(entry.clone());
        let excess = entries.len().saturating_sub(self.limit);
        if excess > 0 {
            entries.drain(..excess);
            tracing::debug!(subscription_id, evicted = excess, "trimmed delivery log");
        }

        if let Err(e) = self.save(subscription_id, entries) {
            tracing::error!(subscription_id, error = %e, "failed to persist delivery log");
        }

        Some(entry)
    }

    /// Entries for one subscription, newest first.
    pub fn entries(&self, subscription_id: u64) -> Vec<DeliveryLogEntry> {
        let Some(slot) = self.live_slot(subscription_id) else {
            return Vec::new();
        };
        let history = lock(&slot);
        history.entries.iter().rev().cloned().collect()
    }

    /// Status code of the newest entry, `None` if nothing was ever delivered.
    pub fn last_status(&self, subscription_id: u64) -> Option<u16> {
        let slot = self.live_slot(subscription_id)?;
        let history = lock(&slot);
        history.entries.last().map(|e| e.response_status)
    }

    pub fn count(&self, subscription_id: u64) -> usize {
        let Some(slot) = self.live_slot(subscription_id) else {
            return 0;
        };
        let len = lock(&slot).entries.len();
        len
    }

    /// Drop the history of a deleted subscription, in memory and on disk.
    /// Later appends for it are discarded.
    pub fn remove_subscription(&self, subscription_id: u64) -> Result<(), LogStoreError> {
        let slot = {
            let mut slots = self.lock_slots();
            slots.retired.insert(subscription_id);
            slots.live.remove(&subscription_id)
        };
        // Hold the slot while the file goes so an append racing with the
        // removal cannot write it back.
        let mut history = slot.as_ref().map(lock);
        if let Some(h) = history.as_mut() {
            h.retired = true;
            h.entries.clear();
        }

        let Some(dir) = self.deliveries_dir() else {
            return Ok(());
        };
        remove_file(&dir.join(format!("{subscription_id}.json")))
    }

    /// `None` once the subscription has been removed.
    fn slot(&self, subscription_id: u64) -> Option<Slot> {
        let mut slots = self.lock_slots();
        if slots.retired.contains(&subscription_id) {
            return None;
        }
        Some(slots.live.entry(subscription_id).or_default().clone())
    }

    fn live_slot(&self, subscription_id: u64) -> Option<Slot> {
        self.lock_slots().live.get(&subscription_id).cloned()
    }

    fn lock_slots(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn deliveries_dir(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|d| d.join("deliveries"))
    }

    fn save(&self, subscription_id: u64, entries: &[DeliveryLogEntry]) -> Result<(), LogStoreError> {
        let Some(dir) = self.deliveries_dir() else {
            return Ok(());
        };
        std::fs::create_dir_all(&dir).map_err(|source| LogStoreError::Io {
            action: "create",
            path: dir.display().to_string(),
            source,
        })?;
        let path = dir.join(format!("{subscription_id}.json"));
        let content = serde_json::to_string_pretty(entries).map_err(|source| LogStoreError::Json {
            path: path.display().to_string(),
            source,
        })?;
        std::fs::write(&path, content).map_err(|source| LogStoreError::Io {
            action: "write",
            path: path.display().to_string(),
            source,
        })
    }
}

fn lock(slot: &Slot) -> MutexGuard<'_, History> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

fn remove_file(path: &Path) -> Result<(), LogStoreError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(LogStoreError::Io {
            action: "remove",
            path: path.display().to_string(),
            source,
        }),
    }
}

fn read_entries(path: &Path) -> Result<Vec<DeliveryLogEntry>, LogStoreError> {
    let content = std::fs::read_to_string(path).map_err(|source| LogStoreError::Io {
        action: "read",
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| LogStoreError::Json {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EntityKind;
    use std::collections::BTreeMap;

    fn attempt(subscription_id: u64, status: u16) -> NewDelivery {
        NewDelivery {
            subscription_id,
            trigger_kind: EntityKind::Submission,
            request_url: "http://example.com/hook".into(),
            request_body: serde_json::json!({ "event": "create" }),
            request_headers: BTreeMap::new(),
            response_status: status,
            response_body: String::new(),
            response_headers: BTreeMap::new(),
        }
    }

    #[test]
    fn entries_are_newest_first() {
        let log = DeliveryLog::new(None);
        log.append(attempt(1, 200));
        log.append(attempt(1, 500));
        let statuses: Vec<u16> = log.entries(1).iter().map(|e| e.response_status).collect();
        assert_eq!(statuses, vec![500, 200]);
        assert_eq!(log.last_status(1), Some(500));
    }

    #[test]
    fn never_delivered_has_no_status() {
        let log = DeliveryLog::new(None);
        assert_eq!(log.last_status(7), None);
        assert!(log.entries(7).is_empty());
    }

    #[test]
    fn eviction_keeps_the_most_recent() {
        let log = DeliveryLog::new(None);
        let ids: Vec<u64> = (0..15).map(|i| log.append(attempt(3, 200 + i)).unwrap().id).collect();
        let kept: Vec<u64> = log.entries(3).iter().map(|e| e.id).collect();
        let expected: Vec<u64> = ids[5..].iter().rev().copied().collect();
        assert_eq!(kept, expected);
    }

    #[test]
    fn subscriptions_are_bounded_independently() {
        let log = DeliveryLog::with_limit(2, None);
        for _ in 0..5 {
            log.append(attempt(1, 200));
        }
        log.append(attempt(2, 200));
        assert_eq!(log.count(1), 2);
        assert_eq!(log.count(2), 1);
    }

    #[test]
    fn concurrent_appends_respect_the_bound() {
        let log = Arc::new(DeliveryLog::new(None));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let log = log.clone();
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        log.append(attempt(9, 200));
                        assert!(log.count(9) <= RETENTION_LIMIT);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(log.count(9), RETENTION_LIMIT);
        let entries = log.entries(9);
        // newest first, strictly by (created_at, id)
        for pair in entries.windows(2) {
            assert!((pair[0].created_at, pair[0].id) > (pair[1].created_at, pair[1].id));
        }
    }

    #[test]
    fn persisted_log_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let log = DeliveryLog::new(Some(dir.path().to_path_buf()));
        for i in 0..12 {
            log.append(attempt(4, 200 + i));
        }
        let before = log.entries(4);

        let reloaded = DeliveryLog::new(Some(dir.path().to_path_buf()));
        assert_eq!(reloaded.load(|_| true).unwrap(), 1);
        assert_eq!(reloaded.entries(4), before);

        let next = reloaded.append(attempt(4, 299)).unwrap();
        assert!(next.id > before[0].id);
        assert_eq!(reloaded.count(4), RETENTION_LIMIT);
    }

    #[test]
    fn removing_a_subscription_deletes_its_file() {
        let dir = tempfile::tempdir().unwrap();
        let log = DeliveryLog::new(Some(dir.path().to_path_buf()));
        log.append(attempt(5, 200));
        let file = dir.path().join("deliveries").join("5.json");
        assert!(file.exists());

        log.remove_subscription(5).unwrap();
        assert!(!file.exists());
        assert_eq!(log.count(5), 0);
        // removing twice is fine
        log.remove_subscription(5).unwrap();
    }

    #[test]
    fn appends_after_removal_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let log = DeliveryLog::new(Some(dir.path().to_path_buf()));
        log.append(attempt(8, 200));
        log.remove_subscription(8).unwrap();

        assert!(log.append(attempt(8, 200)).is_none());
        assert_eq!(log.count(8), 0);
        assert_eq!(log.last_status(8), None);
        assert!(!dir.path().join("deliveries").join("8.json").exists());

        // never-seen ids can be retired too
        log.remove_subscription(9).unwrap();
        assert!(log.append(attempt(9, 200)).is_none());
    }

    #[test]
    fn reload_discards_unknown_subscriptions() {
        let dir = tempfile::tempdir().unwrap();
        let log = DeliveryLog::new(Some(dir.path().to_path_buf()));
        log.append(attempt(1, 200));
        log.append(attempt(2, 500));

        let reloaded = DeliveryLog::new(Some(dir.path().to_path_buf()));
        assert_eq!(reloaded.load(|id| id == 1).unwrap(), 1);
        assert_eq!(reloaded.last_status(1), Some(200));
        assert_eq!(reloaded.last_status(2), None);
        assert!(!dir.path().join("deliveries").join("2.json").exists());
    }

    #[test]
    fn unwritable_data_dir_still_records_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();
        let log = DeliveryLog::new(Some(blocker));
        log.append(attempt(6, 201));
        assert_eq!(log.last_status(6), Some(201));
    }
}
