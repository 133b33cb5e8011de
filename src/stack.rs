//! Stack descriptor model and rewrites
//!
//! A stack descriptor is the in-memory form of a Compose v3 file. Rewrites
//! operate on whatever is present and log what they dropped; serialization
//! is canonical (sorted mapping keys at every level, block style, no
//! anchors) so equal descriptors always produce equal bytes.

use std::collections::HashSet;

use serde_yaml::{Mapping, Value};
use tracing::debug;

use crate::errors::AgentError;
use crate::utils::sha256_hash;

/// In-memory Compose stack document
#[derive(Debug, Clone, PartialEq)]
pub struct StackDescriptor {
    doc: Mapping,
}

impl StackDescriptor {
    /// Parse a stack file. Duplicate keys are an error.
    pub fn parse(text: &str) -> Result<Self, AgentError> {
        let value: Value = serde_yaml::from_str(text)
            .map_err(|e| AgentError::Recipe(format!("cannot parse stack file: {}", e)))?;
        match value {
            Value::Mapping(doc) => Ok(Self { doc }),
            _ => Err(AgentError::Recipe(
                "stack file is not a mapping".to_string(),
            )),
        }
    }

    pub fn from_mapping(doc: Mapping) -> Self {
        Self { doc }
    }

    pub fn service_names(&self) -> Vec<String> {
        self.services()
            .map(|services| {
                services
                    .keys()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Image references of every service, in document order.
    pub fn image_refs(&self) -> Vec<String> {
        let mut refs = Vec::new();
        if let Some(services) = self.services() {
            for (_, spec) in services {
                if let Some(image) = spec.get("image").and_then(Value::as_str) {
                    refs.push(image.to_string());
                }
            }
        }
        refs
    }

    fn services(&self) -> Option<&Mapping> {
        self.doc.get("services").and_then(Value::as_mapping)
    }

    fn services_mut(&mut self) -> Option<&mut Mapping> {
        self.doc.get_mut("services").and_then(Value::as_mapping_mut)
    }

    /// Rename every service `S` to `<prefix>_S` and update cross-service
    /// references (`depends_on`, `links`, `network_mode: service:S`,
    /// `extends.service`).
    pub fn prefix_services(&mut self, prefix: &str) {
        if prefix.is_empty() {
            return;
        }
        let Some(services) = self.services_mut() else {
            return;
        };

        let original: HashSet<String> = services
            .keys()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect();

        let old = std::mem::take(services);
        for (key, spec) in old {
            let new_key = match key.as_str() {
                Some(name) => Value::String(format!("{}_{}", prefix, name)),
                None => key,
            };
            services.insert(new_key, spec);
        }

        let rename = |name: &str| -> Option<String> {
            original
                .contains(name)
                .then(|| format!("{}_{}", prefix, name))
        };

        for (_, spec) in services.iter_mut() {
            let Some(spec) = spec.as_mapping_mut() else {
                continue;
            };
            rewrite_depends_on(spec, &rename);
            rewrite_links(spec, &rename);
            rewrite_network_mode(spec, &rename);
            rewrite_extends(spec, &rename);
        }
    }

    /// Drop the named services and prune `depends_on` entries that point at
    /// services no longer present. `names` are current (post-prefix) names.
    pub fn exclude_services(&mut self, names: &[String]) {
        let Some(services) = self.services_mut() else {
            return;
        };
        for name in names {
            if services.remove(name.as_str()).is_some() {
                debug!("excluded service '{}'", name);
            }
        }

        let remaining: HashSet<String> = services
            .keys()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect();

        for (_, spec) in services.iter_mut() {
            let Some(spec) = spec.as_mapping_mut() else {
                continue;
            };
            prune_depends_on(spec, &remaining);
        }
    }

    /// Drop the named top-level volumes and every service mount entry that
    /// references one of them.
    pub fn exclude_volumes(&mut self, names: &[String]) {
        if let Some(volumes) = self.doc.get_mut("volumes").and_then(Value::as_mapping_mut) {
            for name in names {
                if volumes.remove(name.as_str()).is_some() {
                    debug!("excluded volume '{}'", name);
                }
            }
        }

        let excluded: HashSet<&str> = names.iter().map(String::as_str).collect();
        let Some(services) = self.services_mut() else {
            return;
        };
        for (_, spec) in services.iter_mut() {
            let Some(mounts) = spec
                .as_mapping_mut()
                .and_then(|m| m.get_mut("volumes"))
                .and_then(Value::as_sequence_mut)
            else {
                continue;
            };
            mounts.retain(|entry| !mount_references(entry, &excluded));
        }
    }

    /// Deep-merge overlay keys into every service. Mappings merge key-wise
    /// with the overlay winning, sequences are replaced unless the overlay
    /// is empty, scalars replace.
    pub fn merge_additional_parameters(&mut self, overlay: &Mapping) {
        if overlay.is_empty() {
            return;
        }
        let Some(services) = self.services_mut() else {
            return;
        };
        for (_, spec) in services.iter_mut() {
            let Some(spec) = spec.as_mapping_mut() else {
                continue;
            };
            for (key, value) in overlay {
                if is_empty_overlay(value) {
                    continue;
                }
                match spec.get_mut(key) {
                    Some(existing) => merge_overlay_value(existing, value),
                    None => {
                        spec.insert(key.clone(), value.clone());
                    }
                }
            }
        }
    }

    /// Remove each service's `build` section, useless in a swarm stack.
    pub fn strip_build_keys(&mut self) {
        let Some(services) = self.services_mut() else {
            return;
        };
        for (_, spec) in services.iter_mut() {
            if let Some(spec) = spec.as_mapping_mut() {
                spec.remove("build");
            }
        }
    }

    /// Normalize the degenerate `extra_hosts: {"": ""}` form emitted by some
    /// compose generators to an empty list.
    pub fn normalize_extra_hosts(&mut self) {
        let Some(services) = self.services_mut() else {
            return;
        };
        for (_, spec) in services.iter_mut() {
            let Some(spec) = spec.as_mapping_mut() else {
                continue;
            };
            let degenerate = spec
                .get("extra_hosts")
                .and_then(Value::as_mapping)
                .map(|hosts| {
                    hosts.len() == 1
                        && hosts.get("").and_then(Value::as_str) == Some("")
                })
                .unwrap_or(false);
            if degenerate {
                spec.insert(
                    Value::String("extra_hosts".to_string()),
                    Value::Sequence(Vec::new()),
                );
            }
        }
    }

    /// Serialize with sorted mapping keys at every level.
    pub fn canonical_yaml(&self) -> Result<String, AgentError> {
        let sorted = sort_value(&Value::Mapping(self.doc.clone()));
        Ok(serde_yaml::to_string(&sorted)?)
    }

    /// Digest of the canonical serialization; the unit of idempotence for
    /// remote deploys.
    pub fn digest(&self) -> Result<String, AgentError> {
        Ok(sha256_hash(self.canonical_yaml()?.as_bytes()))
    }
}

fn rewrite_depends_on(spec: &mut Mapping, rename: &dyn Fn(&str) -> Option<String>) {
    let Some(depends) = spec.get_mut("depends_on") else {
        return;
    };
    match depends {
        Value::Sequence(entries) => {
            for entry in entries.iter_mut() {
                if let Some(renamed) = entry.as_str().and_then(rename) {
                    *entry = Value::String(renamed);
                }
            }
        }
        Value::Mapping(entries) => {
            let old = std::mem::take(entries);
            for (key, value) in old {
                let new_key = match key.as_str().and_then(rename) {
                    Some(renamed) => Value::String(renamed),
                    None => key,
                };
                entries.insert(new_key, value);
            }
        }
        _ => {}
    }
}

fn rewrite_links(spec: &mut Mapping, rename: &dyn Fn(&str) -> Option<String>) {
    let Some(links) = spec.get_mut("links").and_then(Value::as_sequence_mut) else {
        return;
    };
    for entry in links.iter_mut() {
        let Some(link) = entry.as_str() else {
            continue;
        };
        let (target, alias) = match link.split_once(':') {
            Some((target, alias)) => (target, Some(alias)),
            None => (link, None),
        };
        if let Some(renamed) = rename(target) {
            *entry = Value::String(match alias {
                Some(alias) => format!("{}:{}", renamed, alias),
                None => renamed,
            });
        }
    }
}

fn rewrite_network_mode(spec: &mut Mapping, rename: &dyn Fn(&str) -> Option<String>) {
    let Some(mode) = spec.get_mut("network_mode") else {
        return;
    };
    let Some(text) = mode.as_str() else {
        return;
    };
    if let Some(target) = text.strip_prefix("service:") {
        if let Some(renamed) = rename(target) {
            *mode = Value::String(format!("service:{}", renamed));
        }
    }
}

fn rewrite_extends(spec: &mut Mapping, rename: &dyn Fn(&str) -> Option<String>) {
    let Some(extends) = spec.get_mut("extends").and_then(Value::as_mapping_mut) else {
        return;
    };
    let Some(renamed) = extends
        .get("service")
        .and_then(Value::as_str)
        .and_then(rename)
    else {
        return;
    };
    extends.insert(
        Value::String("service".to_string()),
        Value::String(renamed),
    );
}

fn prune_depends_on(spec: &mut Mapping, remaining: &HashSet<String>) {
    let Some(depends) = spec.get_mut("depends_on") else {
        return;
    };
    match depends {
        Value::Sequence(entries) => {
            entries.retain(|entry| {
                entry
                    .as_str()
                    .map(|name| remaining.contains(name))
                    .unwrap_or(true)
            });
        }
        Value::Mapping(entries) => {
            let old = std::mem::take(entries);
            for (key, value) in old {
                let keep = key
                    .as_str()
                    .map(|name| remaining.contains(name))
                    .unwrap_or(true);
                if keep {
                    entries.insert(key, value);
                }
            }
        }
        _ => {}
    }
}

/// Whether a service mount entry references one of the excluded volumes.
fn mount_references(entry: &Value, excluded: &HashSet<&str>) -> bool {
    match entry {
        Value::String(text) => {
            let source = text.split(':').next().unwrap_or(text);
            excluded.contains(source)
        }
        Value::Mapping(mount) => mount
            .get("source")
            .and_then(Value::as_str)
            .map(|source| excluded.contains(source))
            .unwrap_or(false),
        _ => false,
    }
}

/// Empty overlay values never touch the document.
fn is_empty_overlay(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Sequence(s) => s.is_empty(),
        Value::Mapping(m) => m.is_empty(),
        _ => false,
    }
}

fn merge_overlay_value(existing: &mut Value, overlay: &Value) {
    match overlay {
        Value::Mapping(over) => {
            if let Some(base) = existing.as_mapping_mut() {
                for (key, value) in over {
                    match base.get_mut(key) {
                        Some(slot) => merge_overlay_value(slot, value),
                        None => {
                            base.insert(key.clone(), value.clone());
                        }
                    }
                }
            } else {
                *existing = overlay.clone();
            }
        }
        Value::Sequence(seq) => {
            if !seq.is_empty() {
                *existing = overlay.clone();
            }
        }
        _ => {
            *existing = overlay.clone();
        }
    }
}

fn sort_value(value: &Value) -> Value {
    match value {
        Value::Mapping(mapping) => {
            let mut pairs: Vec<(Value, Value)> = mapping
                .iter()
                .map(|(k, v)| (k.clone(), sort_value(v)))
                .collect();
            pairs.sort_by(|a, b| key_repr(&a.0).cmp(&key_repr(&b.0)));
            Value::Mapping(pairs.into_iter().collect())
        }
        Value::Sequence(seq) => Value::Sequence(seq.iter().map(sort_value).collect()),
        other => other.clone(),
    }
}

fn key_repr(key: &Value) -> String {
    match key {
        Value::String(s) => s.clone(),
        other => serde_yaml::to_string(other)
            .unwrap_or_default()
            .trim_end()
            .to_string(),
    }
}
