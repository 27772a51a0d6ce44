//! Derivation of service records from container metadata.
//!
//! Metadata comes from `SERVICE_*` environment entries and labels, labels
//! taking precedence.  Port specific keys (`SERVICE_80_NAME`) override the
//! generic ones (`SERVICE_NAME`).  Derivation never fails: a container that
//! does not describe a usable service simply yields no records.

use std::collections::BTreeMap;

use log::debug;

use crate::config::Config;
use crate::types::{Container, PortMapping, Protocol, ServiceId, ServiceRecord};

const META_PREFIX: &str = "SERVICE_";

/// Derives every service record the container currently describes.
pub fn derive(container: &Container, config: &Config) -> Vec<ServiceRecord> {
    let ports = candidate_ports(container);
    let grouped = ports.len() > 1;

    ports
        .iter()
        .filter_map(|port| derive_port(container, port, grouped, config))
        .collect()
}

fn candidate_ports(container: &Container) -> Vec<PortMapping> {
    let mut ports = container.ports.clone();
    if container.uses_host_network() {
        for port in &mut ports {
            port.host_port.get_or_insert(port.exposed_port);
        }
    }
    ports.sort_by_key(|p| (p.exposed_port, p.protocol));
    ports.dedup_by_key(|p| (p.exposed_port, p.protocol));
    ports
}

fn derive_port(
    container: &Container,
    port: &PortMapping,
    grouped: bool,
    config: &Config,
) -> Option<ServiceRecord> {
    let mut meta = metadata(container, port.exposed_port);

    if meta.contains_key("ignore") {
        debug!(
            "{}: port {} ignored by SERVICE_IGNORE",
            container.short_id(),
            port.exposed_port
        );
        return None;
    }

    let explicit_name = meta.remove("name");
    if config.explicit && explicit_name.is_none() {
        return None;
    }

    if !config.internal && port.host_port.is_none() {
        debug!(
            "{}: port {} not published on host",
            container.short_id(),
            port.exposed_port
        );
        return None;
    }

    let Some(ip) = resolve_ip(container, port, config) else {
        debug!(
            "{}: no routable IP for port {}",
            container.short_id(),
            port.exposed_port
        );
        return None;
    };

    let service_port = if config.internal {
        port.exposed_port
    } else {
        port.host_port?
    };

    let name = explicit_name.unwrap_or_else(|| {
        let base = image_base_name(&container.image);
        if grouped {
            format!("{}-{}", base, port.exposed_port)
        } else {
            base.to_string()
        }
    });

    let id = match meta.remove("id") {
        Some(id) if !id.is_empty() => ServiceId::new(id),
        _ => ServiceId::generate(
            &config.hostname,
            &container.id,
            port.exposed_port,
            port.protocol,
        ),
    };

    let tags = merge_tags(meta.remove("tags").as_deref(), &config.tags);

    Some(ServiceRecord {
        id,
        name,
        ip,
        port: service_port,
        protocol: port.protocol,
        tags,
        attrs: meta,
        container_id: container.id.clone(),
        ttl: config.ttl(),
    })
}

/// Forced host IP, then the IP label, then the internal network IP (when
/// internal ports are announced), then the published binding.
fn resolve_ip(container: &Container, port: &PortMapping, config: &Config) -> Option<String> {
    if let Some(ip) = config.host_ip.as_deref().filter(|ip| !ip.is_empty()) {
        return Some(ip.to_string());
    }

    if let Some(ip) = config
        .use_ip_from_label
        .as_deref()
        .and_then(|label| container.labels.get(label))
        .map(|value| strip_prefix_len(value))
        .filter(|ip| !ip.is_empty())
    {
        return Some(ip.to_string());
    }

    if config.internal {
        if let Some(ip) = container.internal_ip() {
            return Some(ip.to_string());
        }
    }

    port.host_ip
        .as_deref()
        .filter(|ip| !is_unspecified(ip))
        .map(str::to_string)
}

fn strip_prefix_len(value: &str) -> &str {
    value.split('/').next().unwrap_or(value).trim()
}

fn is_unspecified(ip: &str) -> bool {
    matches!(ip, "" | "0.0.0.0" | "::" | "[::]")
}

/// Collects `SERVICE_*` keys for one port, lower-casing the remainder.
fn metadata(container: &Container, port: u16) -> BTreeMap<String, String> {
    let port_prefix = format!("{}_", port);
    let mut generic = BTreeMap::new();
    let mut specific = BTreeMap::new();

    let env = container.env.iter().filter_map(|kv| kv.split_once('='));
    let labels = container
        .labels
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()));

    // labels are applied after env so they win
    for (key, value) in env.chain(labels) {
        let Some(rest) = key.strip_prefix(META_PREFIX) else {
            continue;
        };
        match rest.strip_prefix(&port_prefix) {
            Some(key) if !key.is_empty() => {
                specific.insert(key.to_lowercase(), value.to_string());
            }
            _ if is_port_specific(rest) => {}
            _ if !rest.is_empty() => {
                generic.insert(rest.to_lowercase(), value.to_string());
            }
            _ => {}
        }
    }

    generic.extend(specific);
    generic
}

/// Whether the key targets some other port, e.g. `443_NAME`.
fn is_port_specific(key: &str) -> bool {
    key.split_once('_')
        .is_some_and(|(port, _)| !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()))
}

/// `registry.local:5000/team/redis:7` becomes `redis`.
fn image_base_name(image: &str) -> &str {
    let image = image.split('@').next().unwrap_or(image);
    let base = image.rsplit('/').next().unwrap_or(image);
    base.split(':').next().unwrap_or(base)
}

fn merge_tags(own: Option<&str>, forced: &[String]) -> Vec<String> {
    let mut tags: Vec<String> = Vec::new();
    let own = own
        .into_iter()
        .flat_map(|s| s.split(','))
        .map(str::trim)
        .filter(|t| !t.is_empty());
    for tag in own.chain(forced.iter().map(String::as_str)) {
        if !tags.iter().any(|t| t == tag) {
            tags.push(tag.to_string());
        }
    }
    tags
}
