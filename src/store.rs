//! In-memory bookkeeping of what this host has registered.
//!
//! Every method takes the lock for the duration of a single read or
//! read-modify-write and never across an await point, so registry I/O is
//! never serialised behind it.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::types::{RegistrationEntry, RegistrationState, ServiceId, ServiceRecord};

#[derive(Default)]
pub struct RegistrationStore {
    entries: Mutex<HashMap<ServiceId, RegistrationEntry>>,
}

impl RegistrationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ServiceId, RegistrationEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn put(&self, entry: RegistrationEntry) {
        self.lock().insert(entry.id().clone(), entry);
    }

    pub fn get(&self, id: &ServiceId) -> Option<RegistrationEntry> {
        self.lock().get(id).cloned()
    }

    pub fn remove(&self, id: &ServiceId) -> Option<RegistrationEntry> {
        self.lock().remove(id)
    }

    pub fn all_for_container(&self, container_id: &str) -> Vec<RegistrationEntry> {
        self.lock()
            .values()
            .filter(|e| e.record.container_id == container_id)
            .cloned()
            .collect()
    }

    pub fn all(&self) -> Vec<RegistrationEntry> {
        self.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Claims the record for registration.
    ///
    /// Inserts a pending entry and returns `true` when the identity is
    /// unknown or its last attempt failed.  Returns `false` when it is
    /// already registered or another caller holds the claim.
    pub fn claim(&self, record: &ServiceRecord) -> bool {
        let mut entries = self.lock();
        match entries.get_mut(&record.id) {
            Some(entry) if entry.is_failed() => {
                entry.record = record.clone();
                entry.state = RegistrationState::Pending;
                true
            }
            Some(_) => false,
            None => {
                entries.insert(record.id.clone(), RegistrationEntry::pending(record.clone()));
                true
            }
        }
    }

    /// Records a failed write, keeping the time of the last success.
    pub fn mark_failed(&self, record: ServiceRecord) {
        let mut entries = self.lock();
        let entry = entries
            .entry(record.id.clone())
            .or_insert_with(|| RegistrationEntry::pending(record.clone()));
        entry.record = record;
        entry.state = RegistrationState::Failed;
    }
}
