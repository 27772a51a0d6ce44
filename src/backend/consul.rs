//! Consul agent service API backend.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use reqwest::{Client, Response, StatusCode, Url};
use serde::{Deserialize, Serialize};

use super::{owned_by, RegistryBackend};
use crate::error::BackendError;
use crate::types::{ServiceId, ServiceRecord};

const DEFAULT_PORT: u16 = 8500;
const DEFAULT_TLS_PORT: u16 = 8501;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_CHECK_INTERVAL: &str = "10s";

/// HTTP plumbing shared by the Consul backends.
pub(crate) struct ConsulHttp {
    client: Client,
    base: Url,
}

impl ConsulHttp {
    pub(crate) fn new(url: &Url, tls: bool) -> Result<Self, BackendError> {
        let host = url.host_str().ok_or_else(|| BackendError::InvalidUri {
            uri: url.to_string(),
            reason: "missing host".into(),
        })?;
        let (scheme, default_port) = if tls {
            ("https", DEFAULT_TLS_PORT)
        } else {
            ("http", DEFAULT_PORT)
        };
        let port = url.port().unwrap_or(default_port);
        let base = Url::parse(&format!("{}://{}:{}/", scheme, host, port)).map_err(|e| {
            BackendError::InvalidUri {
                uri: url.to_string(),
                reason: e.to_string(),
            }
        })?;

        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { client, base })
    }

    pub(crate) fn client(&self) -> &Client {
        &self.client
    }

    /// Appends path segments verbatim so identities containing `:` are
    /// never mistaken for a URL scheme.
    pub(crate) fn endpoint<'a>(
        &self,
        segments: impl IntoIterator<Item = &'a str>,
    ) -> Result<Url, BackendError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| BackendError::InvalidUri {
                uri: self.base.to_string(),
                reason: "cannot be a base".into(),
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Succeeds when the cluster has an elected leader.
    pub(crate) async fn leader(&self) -> Result<(), BackendError> {
        let url = self.endpoint(["v1", "status", "leader"])?;
        let response = check(self.client.get(url).send().await?).await?;
        let leader: String = response.json().await?;
        if leader.is_empty() {
            return Err(BackendError::Unavailable("no cluster leader".into()));
        }
        debug!("Consul leader is {}", leader);
        Ok(())
    }
}

/// Maps non-success statuses to [`BackendError::Status`].
pub(crate) async fn check(response: Response) -> Result<Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(BackendError::Status {
        status: status.as_u16(),
        body,
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ServiceRegistration<'a> {
    #[serde(rename = "ID")]
    id: &'a str,
    name: &'a str,
    tags: &'a [String],
    address: &'a str,
    port: u16,
    meta: &'a BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    check: Option<ServiceCheck>,
}

#[derive(Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ServiceCheck {
    #[serde(rename = "TTL", skip_serializing_if = "Option::is_none")]
    ttl: Option<String>,
    #[serde(rename = "HTTP", skip_serializing_if = "Option::is_none")]
    http: Option<String>,
    #[serde(rename = "TCP", skip_serializing_if = "Option::is_none")]
    tcp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    interval: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    deregister_critical_service_after: Option<String>,
}

impl ServiceCheck {
    /// TTL services get a passing TTL check; otherwise `check_http` and
    /// `check_tcp` attributes describe an active check.
    fn for_record(record: &ServiceRecord) -> Option<Self> {
        if let Some(ttl) = record.ttl {
            return Some(ServiceCheck {
                ttl: Some(format!("{}s", ttl)),
                status: Some("passing"),
                deregister_critical_service_after: record.attrs.get("check_deregister_after").cloned(),
                ..Default::default()
            });
        }

        let interval = record
            .attrs
            .get("check_interval")
            .cloned()
            .unwrap_or_else(|| DEFAULT_CHECK_INTERVAL.to_string());
        let address = if record.ip.contains(':') {
            format!("[{}]:{}", record.ip, record.port)
        } else {
            format!("{}:{}", record.ip, record.port)
        };

        if let Some(path) = record.attrs.get("check_http") {
            return Some(ServiceCheck {
                http: Some(format!("http://{}{}", address, path)),
                interval: Some(interval),
                ..Default::default()
            });
        }
        if record.attrs.contains_key("check_tcp") {
            return Some(ServiceCheck {
                tcp: Some(address),
                interval: Some(interval),
                ..Default::default()
            });
        }
        None
    }
}

#[derive(Debug, Deserialize)]
struct AgentService {
    #[serde(rename = "ID")]
    id: String,
}

pub struct ConsulBackend {
    http: ConsulHttp,
}

impl ConsulBackend {
    pub fn new(url: &Url, tls: bool) -> Result<Self, BackendError> {
        Ok(Self {
            http: ConsulHttp::new(url, tls)?,
        })
    }
}

#[async_trait]
impl RegistryBackend for ConsulBackend {
    async fn ping(&self) -> Result<(), BackendError> {
        self.http.leader().await
    }

    async fn register(&self, record: &ServiceRecord) -> Result<(), BackendError> {
        let registration = ServiceRegistration {
            id: record.id.as_str(),
            name: &record.name,
            tags: &record.tags,
            address: &record.ip,
            port: record.port,
            meta: &record.attrs,
            check: ServiceCheck::for_record(record),
        };
        let url = self.http.endpoint(["v1", "agent", "service", "register"])?;
        check(self.http.client().put(url).json(&registration).send().await?).await?;
        Ok(())
    }

    async fn deregister(&self, id: &ServiceId) -> Result<(), BackendError> {
        let url = self
            .http
            .endpoint(["v1", "agent", "service", "deregister", id.as_str()])?;
        let response = self.http.client().put(url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!("{} was not registered with consul", id);
            return Ok(());
        }
        check(response).await?;
        Ok(())
    }

    async fn list_registered(&self, host: &str) -> Result<Vec<ServiceId>, BackendError> {
        let url = self.http.endpoint(["v1", "agent", "services"])?;
        let response = check(self.http.client().get(url).send().await?).await?;
        let services: HashMap<String, AgentService> = response.json().await?;
        Ok(owned_by(
            services.into_values().map(|s| ServiceId::new(s.id)),
            host,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::record;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn backend(server: &MockServer) -> ConsulBackend {
        let url = Url::parse(&server.uri().replace("http://", "consul://")).expect("valid uri");
        ConsulBackend::new(&url, false).expect("backend")
    }

    #[test]
    fn ttl_records_get_a_passing_ttl_check() {
        let mut r = record("c1", "node-1:0123456789ab:80");
        r.ttl = Some(30);
        let check = ServiceCheck::for_record(&r).expect("ttl check");
        assert_eq!(check.ttl.as_deref(), Some("30s"));
        assert_eq!(check.status, Some("passing"));
    }

    #[test]
    fn http_check_attribute_builds_an_http_check() {
        let mut r = record("c1", "node-1:0123456789ab:80");
        r.attrs.insert("check_http".into(), "/health".into());
        r.attrs.insert("check_interval".into(), "5s".into());
        let check = ServiceCheck::for_record(&r).expect("http check");
        assert_eq!(check.http.as_deref(), Some("http://10.0.0.1:8080/health"));
        assert_eq!(check.interval.as_deref(), Some("5s"));
        assert!(ServiceCheck::for_record(&record("c1", "x")).is_none());
    }

    #[tokio::test]
    async fn ping_requires_a_leader() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/status/leader"))
            .respond_with(ResponseTemplate::new(200).set_body_json(""))
            .mount(&server)
            .await;

        let err = backend(&server).await.ping().await.expect_err("no leader");
        assert!(matches!(err, BackendError::Unavailable(_)));
    }

    #[tokio::test]
    async fn register_puts_agent_service() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1/agent/service/register"))
            .and(body_partial_json(serde_json::json!({
                "ID": "node-1:0123456789ab:80",
                "Name": "web",
                "Address": "10.0.0.1",
                "Port": 8080
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let r = record("c1", "node-1:0123456789ab:80");
        backend(&server).await.register(&r).await.expect("register");
    }

    #[tokio::test]
    async fn register_surfaces_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let r = record("c1", "node-1:0123456789ab:80");
        let err = backend(&server).await.register(&r).await.expect_err("500");
        assert!(matches!(err, BackendError::Status { status: 500, .. }));
    }

    #[tokio::test]
    async fn deregister_of_unknown_service_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1/agent/service/deregister/node-1:0123456789ab:80"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        backend(&server)
            .await
            .deregister(&ServiceId::new("node-1:0123456789ab:80"))
            .await
            .expect("404 is treated as gone");
    }

    #[tokio::test]
    async fn list_registered_filters_by_host() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/agent/services"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "node-1:0123456789ab:80": { "ID": "node-1:0123456789ab:80", "Service": "web" },
                "node-2:0123456789ab:80": { "ID": "node-2:0123456789ab:80", "Service": "web" },
                "consul": { "ID": "consul", "Service": "consul" }
            })))
            .mount(&server)
            .await;

        let ids = backend(&server)
            .await
            .list_registered("node-1")
            .await
            .expect("list");
        assert_eq!(ids, vec![ServiceId::new("node-1:0123456789ab:80")]);
    }
}
