//! Connection lookup for actions that need third-party credentials.
//!
//! Resolution is best-effort: misses and resolver errors are logged and the
//! action runs without a connection. Whether one is mandatory is up to the
//! handler.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::batch::{APP_KEY, CONNECTION_KEY, Metadata, metadata_string};
use crate::registry::ToolkitCatalog;

/// Tokens expiring within this window are treated as unusable.
const EXPIRY_MARGIN_SECS: i64 = 5 * 60;

/// A user's authorized account for a toolkit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub id: String,
    pub user_id: String,
    pub app_key: String,
    #[serde(default)]
    pub name: String,
    /// Lower values are preferred.
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Credential expiry, seconds since the Unix epoch.
    #[serde(default)]
    pub expires_at: Option<i64>,
    #[serde(default)]
    pub labels: Value,
}

fn default_enabled() -> bool {
    true
}

impl Connection {
    pub fn new(id: impl Into<String>, user_id: impl Into<String>, app_key: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            user_id: user_id.into(),
            app_key: app_key.into(),
            name: String::new(),
            priority: 0,
            enabled: true,
            expires_at: None,
            labels: Value::Null,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_expires_at(mut self, expires_at: i64) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Whether the credential is enabled and not about to expire.
    pub fn is_usable(&self, now: i64) -> bool {
        self.enabled
            && self
                .expires_at
                .is_none_or(|exp| exp >= now + EXPIRY_MARGIN_SECS)
    }
}

/// Picks the best available connection for a user and application key.
pub trait ConnectionResolver: Send + Sync {
    fn select(&self, user_id: &str, app_key: &str) -> Result<Option<Connection>, String>;
}

// ── StaticConnections ─────────────────────────────────────────────

/// In-memory resolver keyed by `(user_id, app_key)`.
#[derive(Debug, Default)]
pub struct StaticConnections {
    entries: Mutex<HashMap<(String, String), Vec<Connection>>>,
}

impl StaticConnections {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, connection: Connection) {
        let key = (connection.user_id.clone(), connection.app_key.clone());
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let list = entries.entry(key).or_default();
        list.retain(|c| c.id != connection.id);
        list.push(connection);
        list.sort_by_key(|c| c.priority);
    }

    /// Add a connection (builder pattern).
    pub fn with(self, connection: Connection) -> Self {
        self.insert(connection);
        self
    }

    pub fn len(&self) -> usize {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ConnectionResolver for StaticConnections {
    fn select(&self, user_id: &str, app_key: &str) -> Result<Option<Connection>, String> {
        let now = chrono::Utc::now().timestamp();
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries
            .get(&(user_id.to_string(), app_key.to_string()))
            .and_then(|list| list.iter().find(|c| c.is_usable(now)).cloned()))
    }
}

// ── Group resolution ──────────────────────────────────────────────

/// Connection attached to one action.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConnection {
    pub id: String,
    /// The full record, when it came from the resolver rather than an
    /// explicit `connection` field.
    pub connection: Option<Connection>,
}

/// Resolve connections for every member of a tool group.
///
/// An explicit `connection` field passes through unchanged, an `app_key`
/// is looked up directly, and anything else falls back to the toolkit that
/// owns `slug`. Returns the resolved entries keyed by original index.
pub fn resolve_group(
    slug: &str,
    indices: &[usize],
    metadata: &[Metadata],
    user_id: &str,
    resolver: &dyn ConnectionResolver,
    catalog: Option<&dyn ToolkitCatalog>,
    trace_id: &str,
) -> HashMap<usize, ResolvedConnection> {
    let mut resolved = HashMap::new();
    // Toolkit discovery happens at most once per group.
    let mut owning_toolkit: Option<Option<String>> = None;

    for &idx in indices {
        let Some(meta) = metadata.get(idx) else {
            continue;
        };

        if let Some(id) = meta.get(CONNECTION_KEY).and_then(metadata_string) {
            resolved.insert(
                idx,
                ResolvedConnection {
                    id,
                    connection: None,
                },
            );
            continue;
        }

        let app_key = match meta.get(APP_KEY).and_then(metadata_string) {
            Some(key) => key,
            None => {
                let toolkit = owning_toolkit
                    .get_or_insert_with(|| catalog.and_then(|c| find_toolkit(c, slug)));
                match toolkit {
                    Some(name) => name.clone(),
                    None => continue,
                }
            }
        };

        match resolver.select(user_id, &app_key) {
            Ok(Some(connection)) => {
                debug!("[{trace_id}] Resolved connection {} for {slug}", connection.id);
                resolved.insert(
                    idx,
                    ResolvedConnection {
                        id: connection.id.clone(),
                        connection: Some(connection),
                    },
                );
            }
            Ok(None) => warn!("[{trace_id}] No connection found for app_key: {app_key}"),
            Err(e) => error!("[{trace_id}] Failed to resolve connection for app_key {app_key}: {e}"),
        }
    }

    resolved
}

/// Find the toolkit whose tool list contains `slug`.
fn find_toolkit(catalog: &dyn ToolkitCatalog, slug: &str) -> Option<String> {
    catalog
        .list_toolkits()
        .into_iter()
        .find(|toolkit| catalog.list_tools(&toolkit.name).iter().any(|t| t.slug == slug))
        .map(|toolkit| toolkit.name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ToolDescriptor, ToolHandler, ToolRegistry};
    use serde_json::json;

    struct FailingResolver;

    impl ConnectionResolver for FailingResolver {
        fn select(&self, _user_id: &str, _app_key: &str) -> Result<Option<Connection>, String> {
            Err("database unavailable".into())
        }
    }

    fn meta(pairs: &[(&str, &str)]) -> Metadata {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), json!(v)))
            .collect()
    }

    fn catalog() -> ToolRegistry {
        ToolRegistry::new().with_toolkit("github", "GitHub").with(
            ToolDescriptor::new("github.list_repos", "List repositories", json!({})),
            ToolHandler::blocking(|args, _| Ok(args)),
        )
    }

    #[test]
    fn select_prefers_lowest_priority_and_skips_disabled() {
        let store = StaticConnections::new()
            .with(Connection::new("c-low", "u1", "github").with_priority(1).with_enabled(false))
            .with(Connection::new("c-mid", "u1", "github").with_priority(2))
            .with(Connection::new("c-high", "u1", "github").with_priority(5));
        let picked = store.select("u1", "github").unwrap().unwrap();
        assert_eq!(picked.id, "c-mid");
        assert!(store.select("u2", "github").unwrap().is_none());
    }

    #[test]
    fn select_skips_expiring_credentials() {
        let now = chrono::Utc::now().timestamp();
        let store = StaticConnections::new()
            .with(Connection::new("stale", "u1", "slack").with_expires_at(now + 10))
            .with(Connection::new("fresh", "u1", "slack").with_priority(1).with_expires_at(now + 3600));
        assert_eq!(store.select("u1", "slack").unwrap().unwrap().id, "fresh");
    }

    #[test]
    fn insert_replaces_same_id() {
        let store = StaticConnections::new()
            .with(Connection::new("c1", "u1", "github").with_priority(3))
            .with(Connection::new("c1", "u1", "github").with_priority(0));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn explicit_connection_passes_through() {
        let store = StaticConnections::new();
        let metadata = vec![meta(&[("connection", "conn-42")])];
        let out = resolve_group("github.list_repos", &[0], &metadata, "u1", &store, None, "tr");
        assert_eq!(out[&0].id, "conn-42");
        assert!(out[&0].connection.is_none());
    }

    #[test]
    fn non_string_connection_ids_pass_through() {
        let store = StaticConnections::new().with(Connection::new("c-gh", "u1", "github"));
        let metadata: Vec<Metadata> = [
            json!({"connection": 42}),
            json!({"connection": 0, "app_key": "github"}),
        ]
        .into_iter()
        .map(|v| v.as_object().cloned().unwrap())
        .collect();
        let out = resolve_group("any.tool", &[0, 1], &metadata, "u1", &store, None, "tr");
        assert_eq!(out[&0].id, "42");
        assert!(out[&0].connection.is_none());
        // A falsy connection falls back to the app key.
        assert_eq!(out[&1].id, "c-gh");
    }

    #[test]
    fn app_key_uses_resolver() {
        let store = StaticConnections::new().with(Connection::new("c-gh", "u1", "github"));
        let metadata = vec![meta(&[("app_key", "github")]), meta(&[("app_key", "jira")])];
        let out = resolve_group("any.tool", &[0, 1], &metadata, "u1", &store, None, "tr");
        assert_eq!(out[&0].id, "c-gh");
        assert!(out[&0].connection.is_some());
        assert!(!out.contains_key(&1));
    }

    #[test]
    fn toolkit_discovered_from_catalog() {
        let store = StaticConnections::new().with(Connection::new("c-gh", "u1", "github"));
        let registry = catalog();
        let metadata = vec![Metadata::new(), Metadata::new()];
        let out = resolve_group(
            "github.list_repos",
            &[0, 1],
            &metadata,
            "u1",
            &store,
            Some(&registry),
            "tr",
        );
        assert_eq!(out.len(), 2);
        assert_eq!(out[&1].id, "c-gh");
    }

    #[test]
    fn resolver_errors_are_not_fatal() {
        let metadata = vec![meta(&[("app_key", "github")])];
        let out = resolve_group("github.list_repos", &[0], &metadata, "u1", &FailingResolver, None, "tr");
        assert!(out.is_empty());
    }
}
