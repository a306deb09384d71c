//! Store that transfers ownership through leases
//!
//! `take` moves a row out of the store. The caller holds it as a `Lease`
//! until it is put back or dropped. A lease that outlives its hold timer is
//! reclaimed: the row as it was taken goes back and the late holder gets
//! `LeaseExpired`.
//!
//! Inside a tokio runtime every lease arms its own hold timer. Outside one,
//! expired leases are reclaimed by the next store access.

use super::keys::KeyShape;
use super::table::Table;
use super::{AppData, Cache};
use crate::error::{Error, Result};
use crate::transaction::CommitEntry;
use databus_common::{KeyPath, Payload};
use databus_protocol::ResultRow;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

struct LeaseRecord {
    id: u64,
    deadline: Instant,
    original: Payload,
    timer: Option<tokio::task::JoinHandle<()>>,
}

impl LeaseRecord {
    fn disarm(&self) {
        if let Some(timer) = &self.timer {
            timer.abort();
        }
    }
}

struct SafeShared {
    table: Table,
    leases: Mutex<HashMap<KeyPath, LeaseRecord>>,
    timeout: Duration,
    next_id: AtomicU64,
}

impl SafeShared {
    /// Hold timer for one lease; does nothing outside a tokio runtime
    fn arm(shared: &Arc<SafeShared>, path: KeyPath, id: u64) -> Option<tokio::task::JoinHandle<()>> {
        let runtime = tokio::runtime::Handle::try_current().ok()?;
        let weak: Weak<SafeShared> = Arc::downgrade(shared);
        let timeout = shared.timeout;
        Some(runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(shared) = weak.upgrade() {
                shared.reclaim(&path, id);
            }
        }))
    }

    /// Return one lease's original row if it is still outstanding
    fn reclaim(&self, path: &KeyPath, id: u64) -> bool {
        let mut leases = self.leases.lock();
        if !matches!(leases.get(path), Some(record) if record.id == id) {
            return false;
        }
        let Some(record) = leases.remove(path) else {
            return false;
        };
        tracing::debug!("Hold timer reclaimed lease {} on {}", record.id, path);
        self.table.put(path.clone(), record.original);
        true
    }

    fn reclaim_expired(&self) -> usize {
        let now = Instant::now();
        let mut leases = self.leases.lock();
        let expired: Vec<KeyPath> = leases
            .iter()
            .filter(|(_, record)| now >= record.deadline)
            .map(|(path, _)| path.clone())
            .collect();

        for path in &expired {
            if let Some(record) = leases.remove(path) {
                record.disarm();
                tracing::debug!("Reclaimed expired lease {} on {}", record.id, path);
                self.table.put(path.clone(), record.original);
            }
        }
        expired.len()
    }

    fn return_value(&self, path: &KeyPath, id: u64, value: Payload) -> Result<()> {
        let mut leases = self.leases.lock();
        match leases.remove(path) {
            Some(record) if record.id == id => {
                record.disarm();
                if Instant::now() >= record.deadline {
                    self.table.put(path.clone(), record.original);
                    return Err(Error::LeaseExpired(path.clone()));
                }
                self.table.put(path.clone(), value);
                Ok(())
            }
            Some(other) => {
                leases.insert(path.clone(), other);
                Err(Error::LeaseExpired(path.clone()))
            }
            None => Err(Error::LeaseExpired(path.clone())),
        }
    }

    fn ensure_unleased(&self, path: &KeyPath) -> Result<()> {
        if self.leases.lock().contains_key(path) {
            return Err(Error::InvalidState(format!("{path} is leased")));
        }
        Ok(())
    }
}

pub struct SafeStore {
    shared: Arc<SafeShared>,
}

impl SafeStore {
    pub fn new(base: KeyPath, lease_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(SafeShared {
                table: Table::new(base),
                leases: Mutex::new(HashMap::new()),
                timeout: lease_timeout,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn base(&self) -> &KeyPath {
        self.shared.table.base()
    }

    pub fn len(&self) -> usize {
        self.shared.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn leased(&self) -> usize {
        self.shared.leases.lock().len()
    }

    /// Return every expired lease's original row to the store
    pub fn reclaim_expired(&self) -> usize {
        self.shared.reclaim_expired()
    }

    /// Move a row out of the store
    pub fn take<K: KeyShape>(&self, key: &K) -> Result<Option<Lease>> {
        self.shared.reclaim_expired();
        let path = self.shared.table.path(key)?;

        let mut leases = self.shared.leases.lock();
        if leases.contains_key(&path) {
            return Err(Error::InvalidState(format!("{path} is leased")));
        }
        let Some(value) = self.shared.table.remove(&path) else {
            return Ok(None);
        };

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        leases.insert(
            path.clone(),
            LeaseRecord {
                id,
                deadline: Instant::now() + self.shared.timeout,
                original: value.clone(),
                timer: SafeShared::arm(&self.shared, path.clone(), id),
            },
        );

        Ok(Some(Lease {
            shared: self.shared.clone(),
            path,
            id,
            value,
            returned: false,
        }))
    }
}

/// A row taken out of a `SafeStore`
pub struct Lease {
    shared: Arc<SafeShared>,
    path: KeyPath,
    id: u64,
    value: Payload,
    returned: bool,
}

impl Lease {
    pub fn key(&self) -> &KeyPath {
        &self.path
    }

    pub fn value(&self) -> &Payload {
        &self.value
    }

    pub fn value_mut(&mut self) -> &mut Payload {
        &mut self.value
    }

    /// Give the (possibly modified) row back to the store
    pub fn put_back(mut self) -> Result<()> {
        self.returned = true;
        let value = std::mem::take(&mut self.value);
        self.shared.return_value(&self.path, self.id, value)
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.returned {
            return;
        }
        let value = std::mem::take(&mut self.value);
        if let Err(e) = self.shared.return_value(&self.path, self.id, value) {
            tracing::debug!("Dropped lease on {} not returned: {}", self.path, e);
        }
    }
}

impl<K: KeyShape> AppData<K> for SafeStore {
    fn get(&self, key: &K) -> Result<Option<Payload>> {
        self.shared.reclaim_expired();
        Ok(self.shared.table.get(&self.shared.table.path(key)?))
    }

    fn put(&self, key: &K, value: Payload) -> Result<()> {
        self.shared.reclaim_expired();
        let path = self.shared.table.path(key)?;
        self.shared.ensure_unleased(&path)?;
        self.shared.table.put(path, value);
        Ok(())
    }

    fn create(&self, key: &K, value: Payload) -> Result<()> {
        self.shared.reclaim_expired();
        let path = self.shared.table.path(key)?;
        self.shared.ensure_unleased(&path)?;
        self.shared.table.create(path, value)
    }

    fn delete(&self, key: &K) -> Result<Option<Payload>> {
        self.shared.reclaim_expired();
        let path = self.shared.table.path(key)?;
        self.shared.ensure_unleased(&path)?;
        Ok(self.shared.table.remove(&path))
    }

    fn get_next(&self, after: Option<&K>) -> Result<Option<(K, Payload)>> {
        self.shared.reclaim_expired();
        self.shared.table.next_after(after)
    }
}

impl Cache for SafeStore {
    fn scan(&self, pattern: &KeyPath, after: Option<&KeyPath>) -> Vec<ResultRow> {
        self.shared.reclaim_expired();
        self.shared.table.scan(pattern, after)
    }

    fn apply(&self, entry: &CommitEntry) -> Result<()> {
        let path = self.shared.table.entry_path(entry)?;
        self.shared.ensure_unleased(&path)?;
        self.shared.table.apply(entry)
    }
}
