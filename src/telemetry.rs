//! Best-effort export of service facts to InfluxDB.
//!
//! [`TelemetrySink::record`] returns immediately.  The Influx sink writes
//! each fact on its own tracked task and only logs failures; outstanding
//! writes are drained by [`TelemetrySink::close`] at shutdown.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use reqwest::Client;
use tokio_util::task::TaskTracker;

use crate::config::{Config, InfluxConfig};
use crate::error::BackendError;
use crate::types::{short_id, ServiceRecord};

const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    Registered,
    Refreshed,
    Deregistered,
    Failed,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Registered => "registered",
            ServiceStatus::Refreshed => "refreshed",
            ServiceStatus::Deregistered => "deregistered",
            ServiceStatus::Failed => "failed",
        }
    }
}

/// A point-in-time fact about one service.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceFact {
    pub service_name: String,
    pub container_id: String,
    pub host: String,
    pub port: u16,
    pub ip: String,
    pub status: ServiceStatus,
    pub tags: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl ServiceFact {
    pub fn new(record: &ServiceRecord, host: &str, status: ServiceStatus) -> Self {
        Self {
            service_name: record.name.clone(),
            container_id: record.container_id.clone(),
            host: host.to_string(),
            port: record.port,
            ip: record.ip.clone(),
            status,
            tags: record.tags.clone(),
            timestamp: Utc::now(),
        }
    }

    /// Renders the fact as one InfluxDB line-protocol point.
    pub fn to_line(&self) -> String {
        let mut line = String::from("stat,service_name=");
        line.push_str(&escape_tag(&self.service_name));
        let _ = write!(
            line,
            " container_id={},host={},port={}i,ip={},status={},tags={}",
            quote_field(short_id(&self.container_id)),
            quote_field(&self.host),
            self.port,
            quote_field(&self.ip),
            quote_field(self.status.as_str()),
            quote_field(&self.tags.join(",")),
        );
        if let Some(nanos) = self.timestamp.timestamp_nanos_opt() {
            let _ = write!(line, " {}", nanos);
        }
        line
    }
}

fn escape_tag(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, ',' | '=' | ' ') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn quote_field(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

#[async_trait]
pub trait TelemetrySink: Send + Sync {
    /// Must not block or fail the caller.
    fn record(&self, fact: ServiceFact);

    /// Waits for outstanding writes.  Facts recorded afterwards are dropped.
    async fn close(&self) {}
}

/// Discards every fact.
pub struct NoopSink;

impl TelemetrySink for NoopSink {
    fn record(&self, _fact: ServiceFact) {}
}

/// Writes facts to the InfluxDB v2 write API.
pub struct InfluxSink {
    client: Client,
    config: Arc<InfluxConfig>,
    writes: TaskTracker,
}

impl InfluxSink {
    pub fn new(config: InfluxConfig) -> Result<Self, BackendError> {
        let client = Client::builder().timeout(WRITE_TIMEOUT).build()?;
        Ok(Self {
            client,
            config: Arc::new(config),
            writes: TaskTracker::new(),
        })
    }

    async fn write(client: Client, config: &InfluxConfig, line: String) -> Result<(), BackendError> {
        let url = format!("{}/api/v2/write", config.url.trim_end_matches('/'));
        let response = client
            .post(url)
            .query(&[
                ("org", config.org.as_str()),
                ("bucket", config.bucket.as_str()),
                ("precision", "ns"),
            ])
            .header("Authorization", format!("Token {}", config.token))
            .body(line)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl TelemetrySink for InfluxSink {
    fn record(&self, fact: ServiceFact) {
        if self.writes.is_closed() {
            debug!("Telemetry closed, dropping fact for {}", fact.service_name);
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!("No runtime available, dropping telemetry for {}", fact.service_name);
            return;
        };
        let client = self.client.clone();
        let config = Arc::clone(&self.config);
        let line = fact.to_line();
        self.writes.spawn_on(
            async move {
                if let Err(e) = Self::write(client, &config, line).await {
                    warn!("Failed to write telemetry for {}: {}", fact.service_name, e);
                }
            },
            &handle,
        );
    }

    async fn close(&self) {
        self.writes.close();
        if tokio::time::timeout(WRITE_TIMEOUT, self.writes.wait())
            .await
            .is_err()
        {
            warn!(
                "Abandoning {} telemetry writes still in flight",
                self.writes.len()
            );
        }
    }
}

/// Influx when configured, otherwise a no-op sink.
pub fn from_config(config: &Config) -> Arc<dyn TelemetrySink> {
    match &config.influx {
        Some(influx) => match InfluxSink::new(influx.clone()) {
            Ok(sink) => Arc::new(sink),
            Err(e) => {
                warn!("Telemetry disabled: {}", e);
                Arc::new(NoopSink)
            }
        },
        None => Arc::new(NoopSink),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::record;
    use chrono::TimeZone;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fact() -> ServiceFact {
        let mut r = record("0123456789abcdef", "node-1:0123456789ab:80");
        r.name = "web api".into();
        r.tags = vec!["a".into(), "b".into()];
        ServiceFact {
            timestamp: Utc.timestamp_opt(1_700_000_000, 0).single().expect("valid time"),
            ..ServiceFact::new(&r, "node-1", ServiceStatus::Registered)
        }
    }

    #[test]
    fn line_protocol_escapes_and_truncates() {
        assert_eq!(
            fact().to_line(),
            "stat,service_name=web\\ api container_id=\"0123456789ab\",host=\"node-1\",\
             port=8080i,ip=\"10.0.0.1\",status=\"registered\",tags=\"a,b\" \
             1700000000000000000"
        );
    }

    #[tokio::test]
    async fn influx_sink_posts_line_with_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v2/write"))
            .and(query_param("bucket", "svc"))
            .and(query_param("org", "ops"))
            .and(header("Authorization", "Token secret"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let sink = InfluxSink::new(InfluxConfig {
            url: server.uri(),
            token: "secret".into(),
            org: "ops".into(),
            bucket: "svc".into(),
        })
        .expect("sink");
        InfluxSink::write(sink.client.clone(), &sink.config, fact().to_line())
            .await
            .expect("write");
    }

    #[tokio::test]
    async fn close_drains_recorded_writes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v2/write"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let sink = InfluxSink::new(InfluxConfig {
            url: server.uri(),
            token: "secret".into(),
            org: "ops".into(),
            bucket: "svc".into(),
        })
        .expect("sink");
        sink.record(fact());
        sink.record(fact());
        sink.close().await;

        let received = server.received_requests().await.expect("recording enabled");
        assert_eq!(received.len(), 2);

        sink.record(fact());
        assert!(sink.writes.is_empty());
    }

    #[test]
    fn record_without_runtime_is_dropped() {
        let sink = InfluxSink::new(InfluxConfig {
            url: "http://127.0.0.1:1".into(),
            token: String::new(),
            org: String::new(),
            bucket: String::new(),
        })
        .expect("sink");
        sink.record(fact());
    }
}
