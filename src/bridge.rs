//! Synchronisation between running containers and the registry.
//!
//! The bridge is the only writer of the [`RegistrationStore`].  All four
//! operations may run concurrently; store access is confined to short
//! critical sections and registry calls happen outside of them.  Races
//! between operations on the same container are left for the next
//! [`Bridge::sync`] pass to correct.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use log::{debug, info, warn};

use crate::backend::RegistryBackend;
use crate::config::{Config, DeregisterPolicy};
use crate::error::BridgeError;
use crate::extractor;
use crate::runtime::ContainerRuntime;
use crate::store::RegistrationStore;
use crate::telemetry::{ServiceFact, ServiceStatus, TelemetrySink};
use crate::types::{short_id, RegistrationEntry, ServiceId, ServiceRecord};

/// Outcome of one [`Bridge::refresh`] pass.
#[derive(Debug, Default)]
pub struct RefreshReport {
    pub refreshed: usize,
    pub dropped: usize,
    pub errors: Vec<BridgeError>,
}

/// Outcome of one [`Bridge::sync`] pass.
#[derive(Debug, Default)]
pub struct SyncReport {
    pub registered: usize,
    pub deregistered: usize,
    pub dangling: usize,
    pub errors: Vec<BridgeError>,
}

pub struct Bridge {
    runtime: Arc<dyn ContainerRuntime>,
    backend: Arc<dyn RegistryBackend>,
    telemetry: Arc<dyn TelemetrySink>,
    config: Arc<Config>,
    store: RegistrationStore,
}

impl Bridge {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        backend: Arc<dyn RegistryBackend>,
        telemetry: Arc<dyn TelemetrySink>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            runtime,
            backend,
            telemetry,
            config,
            store: RegistrationStore::new(),
        }
    }

    #[cfg(test)]
    pub fn store(&self) -> &RegistrationStore {
        &self.store
    }

    /// Registers the services of a newly started container.
    ///
    /// A container that is gone or not running is skipped.  Services that
    /// are already registered are left alone.  Every service is attempted;
    /// the first failure is returned and left for the next sync to retry.
    pub async fn add(&self, container_id: &str) -> Result<usize, BridgeError> {
        let Some(container) = self.runtime.inspect(container_id).await? else {
            debug!("{}: container no longer exists", short_id(container_id));
            return Ok(0);
        };
        if !container.running {
            debug!("{}: container is not running", container.short_id());
            return Ok(0);
        }

        let records = extractor::derive(&container, &self.config);
        if records.is_empty() {
            debug!("{}: no services to register", container.short_id());
        }

        let mut added = 0;
        let mut first_error = None;
        for record in records {
            if !self.store.claim(&record) {
                debug!("{}: {} already registered", container.short_id(), record.id);
                continue;
            }
            match self.register(record, ServiceStatus::Registered).await {
                Ok(record) => {
                    info!(
                        "added: {} ({}) {}",
                        container.short_id(),
                        container.name,
                        record.id
                    );
                    added += 1;
                }
                Err(e) => {
                    warn!("{}", e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(added),
        }
    }

    /// Deregisters an exited container's services, subject to the
    /// deregistration policy.  Store entries are dropped even when the
    /// registry call fails; a leaked remote entry is reaped by cleanup.
    ///
    /// Under `on-success` a still running container is left for its `die`
    /// event, and a failed one stays registered but is no longer tracked so
    /// sync does not reap it.
    pub async fn remove_on_exit(&self, container_id: &str) -> Result<usize, BridgeError> {
        if self.config.deregister == DeregisterPolicy::OnSuccess {
            match self.runtime.inspect(container_id).await {
                Ok(Some(container)) if container.running => {
                    debug!(
                        "{}: still running, waiting for exit code",
                        container.short_id()
                    );
                    return Ok(0);
                }
                Ok(Some(container)) => {
                    let code = container.exit_code.unwrap_or(0);
                    if code != 0 {
                        for entry in self.store.all_for_container(container_id) {
                            self.store.remove(entry.id());
                        }
                        info!(
                            "{}: exited with code {}, leaving services registered",
                            container.short_id(),
                            code
                        );
                        return Ok(0);
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(
                    "{}: unable to read exit code, deregistering: {}",
                    short_id(container_id),
                    e
                ),
            }
        }

        let mut removed = 0;
        let mut first_error = None;
        for entry in self.store.all_for_container(container_id) {
            match self.deregister(&entry).await {
                Ok(()) => {
                    info!("removed: {} {}", short_id(container_id), entry.id());
                    removed += 1;
                }
                Err(e) => {
                    warn!("{}", e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(removed),
        }
    }

    /// Re-registers every TTL service to extend its expiry.  Entries whose
    /// container is gone are dropped locally; failures do not stop the pass.
    pub async fn refresh(&self) -> RefreshReport {
        let mut report = RefreshReport::default();
        if self.store.is_empty() {
            return report;
        }

        let mut by_container: BTreeMap<String, Vec<RegistrationEntry>> = BTreeMap::new();
        for entry in self.store.all() {
            if entry.record.ttl.is_some_and(|ttl| ttl > 0) {
                by_container
                    .entry(entry.record.container_id.clone())
                    .or_default()
                    .push(entry);
            }
        }

        for (container_id, entries) in by_container {
            let container = match self.runtime.inspect(&container_id).await {
                Ok(Some(container)) if container.running => container,
                Ok(_) => {
                    for entry in entries {
                        debug!("dropped: {} {}", short_id(&container_id), entry.id());
                        self.store.remove(entry.id());
                        report.dropped += 1;
                    }
                    continue;
                }
                Err(e) => {
                    warn!("{}: refresh skipped: {}", short_id(&container_id), e);
                    report.errors.push(e.into());
                    continue;
                }
            };

            let mut fresh: BTreeMap<ServiceId, ServiceRecord> =
                extractor::derive(&container, &self.config)
                    .into_iter()
                    .map(|r| (r.id.clone(), r))
                    .collect();

            for entry in entries {
                let Some(record) = fresh.remove(entry.id()) else {
                    debug!("dropped: {} {}", container.short_id(), entry.id());
                    self.store.remove(entry.id());
                    report.dropped += 1;
                    continue;
                };
                match self.register(record, ServiceStatus::Refreshed).await {
                    Ok(record) => {
                        debug!(
                            "refreshed: {} {} (previous write {})",
                            container.short_id(),
                            record.id,
                            entry
                                .last_registered
                                .map(|t| t.to_rfc3339())
                                .unwrap_or_else(|| "never".into())
                        );
                        report.refreshed += 1;
                    }
                    Err(e) => {
                        warn!("{}", e);
                        report.errors.push(e);
                    }
                }
            }
        }

        if report.refreshed > 0 || report.dropped > 0 || !report.errors.is_empty() {
            info!(
                "refresh: {} refreshed, {} dropped, {} failed",
                report.refreshed,
                report.dropped,
                report.errors.len()
            );
        }
        report
    }

    /// Reconciles the registry with the running containers.
    ///
    /// Only failing to list containers aborts the pass.  With `quiet` set,
    /// services that were already registered are re-asserted silently.
    pub async fn sync(&self, quiet: bool) -> Result<SyncReport, BridgeError> {
        // snapshot before listing so concurrent adds are not reaped
        let known = self.store.all();
        let containers = self.runtime.list_running().await?;
        let mut report = SyncReport::default();

        if !quiet {
            info!(
                "Syncing services on {} containers ({} tracked)",
                containers.len(),
                self.store.len()
            );
        }

        let running: HashSet<&str> = containers.iter().map(|c| c.id.as_str()).collect();
        let running_short: HashSet<&str> = containers.iter().map(|c| c.short_id()).collect();
        let mut desired: HashSet<ServiceId> = HashSet::new();

        for container in &containers {
            for record in extractor::derive(container, &self.config) {
                desired.insert(record.id.clone());
                // a pending entry belongs to an add still in flight
                let existed = self
                    .store
                    .get(&record.id)
                    .is_some_and(|e| !e.is_failed());
                match self.register(record, ServiceStatus::Registered).await {
                    Ok(record) if existed => {
                        if !quiet {
                            info!("ok: {} {}", container.short_id(), record.id);
                        }
                    }
                    Ok(record) => {
                        info!("added: {} {}", container.short_id(), record.id);
                        report.registered += 1;
                    }
                    Err(e) => {
                        warn!("{}", e);
                        report.errors.push(e);
                    }
                }
            }
        }

        for entry in known {
            if running.contains(entry.record.container_id.as_str()) {
                continue;
            }
            match self.deregister(&entry).await {
                Ok(()) => {
                    info!(
                        "removed: {} {} (container not running)",
                        short_id(&entry.record.container_id),
                        entry.id()
                    );
                    report.deregistered += 1;
                }
                Err(e) => {
                    warn!("{}", e);
                    report.errors.push(e);
                }
            }
        }

        if self.config.cleanup {
            self.cleanup_dangling(&running_short, &desired, &mut report)
                .await;
        }

        if !quiet || report.registered > 0 || report.deregistered > 0 || report.dangling > 0 {
            info!(
                "sync: {} added, {} removed, {} dangling, {} failed",
                report.registered,
                report.deregistered,
                report.dangling,
                report.errors.len()
            );
        }
        Ok(report)
    }

    /// Removes registry entries generated on this host whose container is
    /// not running.
    async fn cleanup_dangling(
        &self,
        running_short: &HashSet<&str>,
        desired: &HashSet<ServiceId>,
        report: &mut SyncReport,
    ) {
        let hostname = &self.config.hostname;
        let remote = match self.backend.list_registered(hostname).await {
            Ok(ids) => ids,
            Err(e) => {
                let e = BridgeError::List(e);
                warn!("cleanup skipped: {}", e);
                report.errors.push(e);
                return;
            }
        };

        for id in remote {
            if desired.contains(&id) || self.store.get(&id).is_some() {
                continue;
            }
            let Some((host, container)) = id.origin() else {
                continue;
            };
            if host != hostname.as_str() || running_short.contains(container) {
                continue;
            }
            match self.backend.deregister(&id).await {
                Ok(()) => {
                    info!("dangling: {} removed", id);
                    report.dangling += 1;
                }
                Err(source) => {
                    let e = BridgeError::Deregister { id, source };
                    warn!("{}", e);
                    report.errors.push(e);
                }
            }
        }
    }

    /// Registers the record and records the outcome in the store.
    async fn register(
        &self,
        record: ServiceRecord,
        status: ServiceStatus,
    ) -> Result<ServiceRecord, BridgeError> {
        match self.backend.register(&record).await {
            Ok(()) => {
                self.emit(&record, status);
                self.store.put(RegistrationEntry::registered(record.clone()));
                Ok(record)
            }
            Err(source) => {
                self.emit(&record, ServiceStatus::Failed);
                let id = record.id.clone();
                self.store.mark_failed(record);
                Err(BridgeError::Register { id, source })
            }
        }
    }

    /// Deregisters the entry and always drops it from the store.
    async fn deregister(&self, entry: &RegistrationEntry) -> Result<(), BridgeError> {
        let result = self.backend.deregister(entry.id()).await;
        self.store.remove(entry.id());
        match result {
            Ok(()) => {
                self.emit(&entry.record, ServiceStatus::Deregistered);
                Ok(())
            }
            Err(source) => Err(BridgeError::Deregister {
                id: entry.id().clone(),
                source,
            }),
        }
    }

    fn emit(&self, record: &ServiceRecord, status: ServiceStatus) {
        self.telemetry
            .record(ServiceFact::new(record, &self.config.hostname, status));
    }
}
