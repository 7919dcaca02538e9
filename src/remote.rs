use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

use reqwest::header::ACCEPT;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, error, info};

use crate::config::ConnectionConfig;
use crate::record::{validate_path, Record};
use crate::registry::Registry;
use crate::UplinkError;

type PathCache = BTreeMap<String, Value>;

/// Online adapter: binds subscribe/append/remove to the hosted realtime
/// database's REST and event-stream interface. The server assigns record
/// ids; a per-path cache mirrors the server state fed by the stream.
pub struct RemoteStore {
    client: reqwest::Client,
    base_url: String,
    auth: Option<String>,
    registry: Arc<Registry>,
    cache: Arc<Mutex<std::collections::HashMap<String, PathCache>>>,
    active_streams: Arc<Mutex<HashSet<String>>>,
}

#[derive(Deserialize)]
struct PushResponse {
    name: String,
}

impl RemoteStore {
    /// Validate the configuration and build the client. Failure here is the
    /// facade's cue to fall back to local mode; it never happens later.
    pub fn connect(config: &ConnectionConfig, registry: Arc<Registry>) -> crate::Result<Self> {
        let endpoint = config.endpoint()?;
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            client,
            base_url: endpoint.as_str().trim_end_matches('/').to_string(),
            auth: config.auth_token().map(str::to_string),
            registry,
            cache: Arc::new(Mutex::new(std::collections::HashMap::new())),
            active_streams: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    fn url_for(&self, path: &str) -> String {
        let mut url = format!("{}/{}.json", self.base_url, path);
        if let Some(auth) = &self.auth {
            url.push_str("?auth=");
            url.push_str(auth);
        }
        url
    }

    /// Current cached snapshot; empty until the stream delivers.
    pub fn read(&self, path: &str) -> Vec<Record> {
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.get(path).map(records_from_cache).unwrap_or_default()
    }

    pub async fn append(&self, path: &str, fields: Map<String, Value>) -> crate::Result<String> {
        validate_path(path)?;
        let mut fields = fields;
        // The server assigns ids; a caller-supplied one is dropped.
        fields.remove("id");
        let response = self
            .client
            .post(self.url_for(path))
            .json(&Value::Object(fields))
            .send()
            .await?
            .error_for_status()?;
        let pushed: PushResponse = response.json().await?;
        debug!("appended {} to {} remotely", pushed.name, path);
        Ok(pushed.name)
    }

    pub async fn remove(&self, path: &str, id: &str) -> crate::Result<()> {
        validate_path(path)?;
        let url = {
            let mut url = format!("{}/{}/{}.json", self.base_url, path, id);
            if let Some(auth) = &self.auth {
                url.push_str("?auth=");
                url.push_str(auth);
            }
            url
        };
        // Deleting an absent child is a server-side no-op, so the operation
        // stays idempotent for free.
        self.client
            .delete(url)
            .send()
            .await?
            .error_for_status()?;
        debug!("removed {} from {} remotely", id, path);
        Ok(())
    }

    /// Make sure a live event stream exists for this path. Idempotent; the
    /// first subscriber of a path starts it.
    pub fn ensure_stream(&self, path: &str) {
        {
            let mut active = self
                .active_streams
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if !active.insert(path.to_string()) {
                return;
            }
        }

        let client = self.client.clone();
        let url = self.url_for(path);
        let path = path.to_string();
        let registry = self.registry.clone();
        let cache = self.cache.clone();
        let active_streams = self.active_streams.clone();

        tokio::spawn(async move {
            info!("opening event stream for {}", path);
            if let Err(e) = run_stream(&client, &url, &path, &registry, &cache).await {
                // A dropped connection is the subscriber's concern; the
                // store never silently reverts to local mode mid-session.
                error!("event stream for {} ended: {}", path, e);
            }
            active_streams
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&path);
        });
    }
}

async fn run_stream(
    client: &reqwest::Client,
    url: &str,
    path: &str,
    registry: &Registry,
    cache: &Mutex<std::collections::HashMap<String, PathCache>>,
) -> crate::Result<()> {
    let mut response = client
        .get(url)
        .header(ACCEPT, "text/event-stream")
        .send()
        .await?
        .error_for_status()?;

    let mut buffer = String::new();
    while let Some(chunk) = response.chunk().await? {
        // Keep-alives arrive even on quiet paths, so an abandoned stream
        // winds down promptly rather than running for the process lifetime.
        if prune_idle_stream(path, registry, cache) {
            info!("closing event stream for {}: no subscribers left", path);
            return Ok(());
        }
        buffer.push_str(&String::from_utf8_lossy(&chunk));
        while let Some(event) = next_sse_event(&mut buffer) {
            match event.name.as_str() {
                "put" | "patch" => {
                    let snapshot = {
                        let mut cache = cache.lock().unwrap_or_else(|e| e.into_inner());
                        let entry = cache.entry(path.to_string()).or_default();
                        apply_stream_event(entry, &event)?;
                        records_from_cache(entry)
                    };
                    registry.notify(path, &snapshot);
                }
                "keep-alive" => {}
                "cancel" | "auth_revoked" => {
                    return Err(UplinkError::Storage(format!(
                        "server terminated stream: {}",
                        event.name
                    )));
                }
                other => debug!("ignoring stream event {}", other),
            }
        }
    }
    Ok(())
}

/// Once every subscriber of a path has unsubscribed, the stream has no
/// audience: drop the mirrored cache and tell the caller to stop reading.
/// A later subscribe starts a fresh stream.
fn prune_idle_stream(
    path: &str,
    registry: &Registry,
    cache: &Mutex<std::collections::HashMap<String, PathCache>>,
) -> bool {
    if registry.has_subscribers(path) {
        return false;
    }
    cache
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(path);
    true
}

#[derive(Debug, PartialEq)]
struct SseEvent {
    name: String,
    data: String,
}

/// Pull the next complete event off the stream buffer. Events are blocks of
/// `event:`/`data:` lines separated by a blank line.
fn next_sse_event(buffer: &mut String) -> Option<SseEvent> {
    // Tolerate CRLF framing. A lone trailing '\r' is left in place until
    // its '\n' arrives in the next chunk.
    if buffer.contains("\r\n") {
        *buffer = buffer.replace("\r\n", "\n");
    }
    let end = buffer.find("\n\n")?;
    let block: String = buffer.drain(..end + 2).collect();

    let mut name = String::new();
    let mut data_lines = Vec::new();
    for line in block.lines() {
        if let Some(rest) = line.strip_prefix("event:") {
            name = rest.trim().to_string();
        } else if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.trim_start().to_string());
        }
    }
    Some(SseEvent {
        name,
        data: data_lines.join("\n"),
    })
}

#[derive(Deserialize)]
struct StreamPayload {
    path: String,
    data: Value,
}

/// Apply one `put`/`patch` event to a path's id-keyed cache. The payload
/// path is relative to the subscribed collection: `/` replaces the whole
/// collection, `/<id>` one record, deeper paths a field within a record.
fn apply_stream_event(cache: &mut PathCache, event: &SseEvent) -> crate::Result<()> {
    let payload: StreamPayload = serde_json::from_str(&event.data)?;
    let segments: Vec<&str> = payload
        .path
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();

    match (event.name.as_str(), segments.as_slice()) {
        ("put", []) => {
            cache.clear();
            if let Value::Object(map) = payload.data {
                for (id, value) in map {
                    cache.insert(id, value);
                }
            }
        }
        ("put", [id]) => {
            if payload.data.is_null() {
                cache.remove(*id);
            } else {
                cache.insert(id.to_string(), payload.data);
            }
        }
        ("put", [id, rest @ ..]) => {
            let entry = cache
                .entry(id.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            set_nested(entry, rest, payload.data);
        }
        ("patch", []) => {
            if let Value::Object(map) = payload.data {
                for (id, value) in map {
                    if value.is_null() {
                        cache.remove(&id);
                    } else {
                        cache.insert(id, value);
                    }
                }
            }
        }
        ("patch", [id, rest @ ..]) => {
            let entry = cache
                .entry(id.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(map) = payload.data {
                for (key, value) in map {
                    let mut segments: Vec<&str> = rest.to_vec();
                    segments.push(&key);
                    set_nested(entry, &segments, value);
                }
            }
        }
        _ => {}
    }
    Ok(())
}

fn set_nested(target: &mut Value, segments: &[&str], value: Value) {
    match segments {
        [] => *target = value,
        [head, rest @ ..] => {
            if !target.is_object() {
                *target = Value::Object(Map::new());
            }
            let map = target.as_object_mut().unwrap();
            if rest.is_empty() && value.is_null() {
                map.remove(*head);
            } else {
                let child = map.entry(head.to_string()).or_insert(Value::Null);
                set_nested(child, rest, value);
            }
        }
    }
}

/// Server mapping → facade record list, in server key order.
fn records_from_cache(cache: &PathCache) -> Vec<Record> {
    cache
        .iter()
        .filter_map(|(id, value)| {
            value
                .as_object()
                .map(|fields| crate::record::from_stored(id, fields))
        })
        .collect()
}
