//! In-memory collaborators for unit tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::backend::{owned_by, RegistryBackend};
use crate::config::Config;
use crate::error::{BackendError, RuntimeError};
use crate::runtime::ContainerRuntime;
use crate::telemetry::{ServiceFact, ServiceStatus, TelemetrySink};
use crate::types::{
    Container, LifecycleEvent, PortMapping, Protocol, ServiceId, ServiceRecord,
};

pub fn test_config() -> Config {
    Config {
        hostname: "node-1".into(),
        registry_uri: "consul://localhost:8500".into(),
        ..Config::default()
    }
}

pub fn published(port: u16, host_ip: &str, host_port: u16) -> PortMapping {
    PortMapping {
        exposed_port: port,
        protocol: Protocol::Tcp,
        host_ip: Some(host_ip.to_string()),
        host_port: Some(host_port),
    }
}

pub fn container(id: &str, image: &str, ports: Vec<PortMapping>) -> Container {
    Container {
        id: id.to_string(),
        name: format!("{}-1", image),
        image: image.to_string(),
        running: true,
        ports,
        ..Default::default()
    }
}

pub fn record(container_id: &str, id: &str) -> ServiceRecord {
    ServiceRecord {
        id: ServiceId::new(id),
        name: "web".into(),
        ip: "10.0.0.1".into(),
        port: 8080,
        protocol: Protocol::Tcp,
        tags: Vec::new(),
        attrs: BTreeMap::new(),
        container_id: container_id.to_string(),
        ttl: None,
    }
}

#[derive(Default)]
pub struct FakeRuntime {
    containers: Mutex<HashMap<String, Container>>,
    events: Mutex<Vec<LifecycleEvent>>,
}

impl FakeRuntime {
    pub fn insert(&self, container: Container) {
        self.containers
            .lock()
            .unwrap()
            .insert(container.id.clone(), container);
    }

    pub fn remove(&self, id: &str) {
        self.containers.lock().unwrap().remove(id);
    }

    pub fn exit(&self, id: &str, code: i64) {
        if let Some(c) = self.containers.lock().unwrap().get_mut(id) {
            c.running = false;
            c.exit_code = Some(code);
        }
    }

    pub fn queue_event(&self, event: LifecycleEvent) {
        self.events.lock().unwrap().push(event);
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn monitor(&self, event_tx: mpsc::Sender<LifecycleEvent>) -> Result<(), RuntimeError> {
        let events: Vec<_> = self.events.lock().unwrap().drain(..).collect();
        for event in events {
            event_tx
                .send(event)
                .await
                .map_err(|_| RuntimeError::ChannelClosed)?;
        }
        Ok(())
    }

    async fn inspect(&self, container_id: &str) -> Result<Option<Container>, RuntimeError> {
        Ok(self.containers.lock().unwrap().get(container_id).cloned())
    }

    async fn list_running(&self) -> Result<Vec<Container>, RuntimeError> {
        let mut running: Vec<_> = self
            .containers
            .lock()
            .unwrap()
            .values()
            .filter(|c| c.running)
            .cloned()
            .collect();
        running.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(running)
    }
}

#[derive(Default)]
pub struct RecordingBackend {
    services: Mutex<BTreeMap<ServiceId, ServiceRecord>>,
    register_calls: AtomicUsize,
    deregister_calls: AtomicUsize,
    ping_calls: AtomicUsize,
    ping_failures: AtomicUsize,
    fail_register: AtomicBool,
    fail_deregister: AtomicBool,
}

impl RecordingBackend {
    pub fn register_calls(&self) -> usize {
        self.register_calls.load(Ordering::SeqCst)
    }

    pub fn deregister_calls(&self) -> usize {
        self.deregister_calls.load(Ordering::SeqCst)
    }

    pub fn ping_calls(&self) -> usize {
        self.ping_calls.load(Ordering::SeqCst)
    }

    pub fn registered(&self) -> BTreeMap<ServiceId, ServiceRecord> {
        self.services.lock().unwrap().clone()
    }

    /// Pretends these identities were registered by an earlier process.
    pub fn seed(&self, ids: &[ServiceId]) {
        let mut services = self.services.lock().unwrap();
        for id in ids {
            services.insert(id.clone(), record("seeded", id.as_str()));
        }
    }

    pub fn fail_registrations(&self, fail: bool) {
        self.fail_register.store(fail, Ordering::SeqCst);
    }

    pub fn fail_deregistrations(&self, fail: bool) {
        self.fail_deregister.store(fail, Ordering::SeqCst);
    }

    /// The next `n` pings fail.
    pub fn fail_pings(&self, n: usize) {
        self.ping_failures.store(n, Ordering::SeqCst);
    }
}

fn unavailable() -> BackendError {
    BackendError::Unavailable("injected failure".into())
}

#[async_trait]
impl RegistryBackend for RecordingBackend {
    async fn ping(&self) -> Result<(), BackendError> {
        self.ping_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.ping_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.ping_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(unavailable());
        }
        Ok(())
    }

    async fn register(&self, record: &ServiceRecord) -> Result<(), BackendError> {
        self.register_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_register.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        self.services
            .lock()
            .unwrap()
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn deregister(&self, id: &ServiceId) -> Result<(), BackendError> {
        self.deregister_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_deregister.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        self.services.lock().unwrap().remove(id);
        Ok(())
    }

    async fn list_registered(&self, host: &str) -> Result<Vec<ServiceId>, BackendError> {
        let ids: Vec<_> = self.services.lock().unwrap().keys().cloned().collect();
        Ok(owned_by(ids, host))
    }
}

#[derive(Default)]
pub struct RecordingSink {
    facts: Mutex<Vec<ServiceFact>>,
}

impl RecordingSink {
    pub fn statuses(&self) -> Vec<ServiceStatus> {
        self.facts.lock().unwrap().iter().map(|f| f.status).collect()
    }
}

impl TelemetrySink for RecordingSink {
    fn record(&self, fact: ServiceFact) {
        self.facts.lock().unwrap().push(fact);
    }
}
