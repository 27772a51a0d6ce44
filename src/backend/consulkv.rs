//! Consul KV backend: one JSON document per service under a key prefix.
//!
//! KV entries do not expire, so a record's TTL is not enforced by the
//! registry; stale keys are only removed by deregistration or cleanup.

use async_trait::async_trait;
use log::debug;
use reqwest::{StatusCode, Url};

use super::consul::{check, ConsulHttp};
use super::{owned_by, RegistryBackend};
use crate::error::BackendError;
use crate::types::{ServiceId, ServiceRecord};

const DEFAULT_PREFIX: &str = "services";

pub struct ConsulKvBackend {
    http: ConsulHttp,
    prefix: Vec<String>,
}

impl ConsulKvBackend {
    pub fn new(url: &Url) -> Result<Self, BackendError> {
        let mut prefix: Vec<String> = url
            .path()
            .split('/')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if prefix.is_empty() {
            prefix.push(DEFAULT_PREFIX.to_string());
        }
        Ok(Self {
            http: ConsulHttp::new(url, false)?,
            prefix,
        })
    }

    fn key_url(&self, leaf: &str) -> Result<Url, BackendError> {
        let segments = ["v1", "kv"]
            .into_iter()
            .chain(self.prefix.iter().map(String::as_str))
            .chain(std::iter::once(leaf));
        self.http.endpoint(segments)
    }

    fn key_prefix(&self) -> String {
        format!("{}/", self.prefix.join("/"))
    }
}

#[async_trait]
impl RegistryBackend for ConsulKvBackend {
    async fn ping(&self) -> Result<(), BackendError> {
        self.http.leader().await
    }

    async fn register(&self, record: &ServiceRecord) -> Result<(), BackendError> {
        let url = self.key_url(record.id.as_str())?;
        let body = serde_json::to_vec(record)?;
        check(self.http.client().put(url).body(body).send().await?).await?;
        Ok(())
    }

    async fn deregister(&self, id: &ServiceId) -> Result<(), BackendError> {
        let url = self.key_url(id.as_str())?;
        check(self.http.client().delete(url).send().await?).await?;
        Ok(())
    }

    async fn list_registered(&self, host: &str) -> Result<Vec<ServiceId>, BackendError> {
        // empty leaf yields a trailing slash, i.e. the whole prefix
        let url = self.key_url("")?;
        let response = self
            .http
            .client()
            .get(url)
            .query(&[("keys", "true")])
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!("No keys under {}", self.key_prefix());
            return Ok(Vec::new());
        }
        let keys: Vec<String> = check(response).await?.json().await?;

        let prefix = self.key_prefix();
        let ids = keys
            .into_iter()
            .filter_map(|key| key.strip_prefix(&prefix).map(str::to_string))
            .filter(|leaf| !leaf.is_empty() && !leaf.contains('/'))
            .map(ServiceId::new);
        Ok(owned_by(ids, host))
    }
}
