//! The three capability listings, fetched once right after the handshake and then served from
//! memory for the rest of the connection.
use crate::error::{BridgeError, Result};
use crate::types::{ListingEntry, Prompt, Resource, ServerCapabilities, Tool};
use mcp_inspector_jsonrpc::{ClientError, JsonRpcClient};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::*;

/// Snapshot of everything the server offers.  Immutable once populated; the only way to refresh
/// it is to start a new connection.
#[derive(Clone, Debug, Default)]
pub struct CapabilityCache {
    tools: Arc<[Tool]>,
    resources: Arc<[Resource]>,
    prompts: Arc<[Prompt]>,
}

impl CapabilityCache {
    /// Enumerate all three categories.
    ///
    /// Categories the server doesn't declare are left empty without asking.  A category whose
    /// listing the server answers with an error is left empty too (with a warning); only
    /// connection-level failures fail the whole population.
    #[instrument(skip_all)]
    pub async fn populate(
        client: &JsonRpcClient,
        capabilities: &ServerCapabilities,
        timeout: Duration,
    ) -> Result<Self> {
        let tools = fetch_listing::<Tool>(client, capabilities, timeout).await?;
        let resources = fetch_listing::<Resource>(client, capabilities, timeout).await?;
        let prompts = fetch_listing::<Prompt>(client, capabilities, timeout).await?;

        info!(
            tools = tools.len(),
            resources = resources.len(),
            prompts = prompts.len(),
            "Capability listings cached"
        );

        Ok(Self {
            tools: tools.into(),
            resources: resources.into(),
            prompts: prompts.into(),
        })
    }

    pub fn tools(&self) -> Arc<[Tool]> {
        self.tools.clone()
    }

    pub fn resources(&self) -> Arc<[Resource]> {
        self.resources.clone()
    }

    pub fn prompts(&self) -> Arc<[Prompt]> {
        self.prompts.clone()
    }
}

async fn fetch_listing<T: ListingEntry>(
    client: &JsonRpcClient,
    capabilities: &ServerCapabilities,
    timeout: Duration,
) -> Result<Vec<T>> {
    let kind = T::KIND;
    if !capabilities.supports(kind) {
        debug!(%kind, "Server does not support this capability; listing is empty");
        return Ok(Vec::new());
    }

    let method = kind.list_method();
    let mut entries: Vec<T> = Vec::new();
    let mut keys = HashSet::new();
    let mut seen_cursors = HashSet::new();
    let mut cursor: Option<String> = None;

    loop {
        let params = cursor.as_ref().map(|cursor| json!({ "cursor": cursor }));
        let result = match client.request(method, params, Some(timeout)).await {
            Ok(result) => result,
            Err(ClientError::Rpc(error)) => {
                warn!(%kind, %error, "Server failed to list a capability it declared; treating it as empty");
                return Ok(entries);
            }
            Err(e) => return Err(e.into()),
        };

        let invalid = |reason: String| BridgeError::InvalidResponse {
            method: method.to_string(),
            reason,
        };

        let page = match result.get(kind.result_key()) {
            Some(Value::Array(page)) => page.clone(),
            Some(Value::Null) | None => Vec::new(),
            Some(other) => {
                return Err(invalid(format!(
                    "'{}' is not an array: {other}",
                    kind.result_key()
                )))
            }
        };

        for raw in page {
            match serde_json::from_value::<T>(raw.clone()) {
                Ok(entry) => {
                    if keys.insert(entry.key().to_string()) {
                        entries.push(entry);
                    } else {
                        warn!(%kind, key = entry.key(), "Server listed a duplicate entry; ignoring it");
                    }
                }
                Err(e) => {
                    warn!(%kind, entry = %raw, error = %e, "Skipping malformed listing entry");
                }
            }
        }

        cursor = match result.get("nextCursor") {
            Some(Value::String(next)) => {
                if !seen_cursors.insert(next.clone()) {
                    warn!(%kind, cursor = %next, "Server repeated a pagination cursor; stopping");
                    break;
                }
                Some(next.clone())
            }
            _ => None,
        };
        if cursor.is_none() {
            break;
        }
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{standard_reply, FakeServer, Reply};
    use assert_matches::assert_matches;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn capabilities(value: Value) -> ServerCapabilities {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn populates_all_declared_categories() {
        let caps = json!({"tools": {}, "resources": {}, "prompts": {}});
        let server = FakeServer::standard(caps.clone());
        let client = server.connect();

        let cache = CapabilityCache::populate(&client, &capabilities(caps), TIMEOUT)
            .await
            .unwrap();

        assert_eq!(cache.tools().len(), 1);
        assert_eq!(cache.tools()[0].name, "echo");
        assert_eq!(cache.resources()[0].uri, "file:///readme.md");
        assert_eq!(cache.prompts()[0].arguments[0].name, "who");
        assert_eq!(
            server.calls(),
            vec!["tools/list", "resources/list", "prompts/list"]
        );
    }

    #[tokio::test]
    async fn undeclared_category_is_not_requested() {
        let caps = json!({"tools": true, "resources": false, "prompts": true});
        let server = FakeServer::standard(caps.clone());
        let client = server.connect();

        let cache = CapabilityCache::populate(&client, &capabilities(caps), TIMEOUT)
            .await
            .unwrap();

        assert!(cache.resources().is_empty());
        assert_eq!(server.call_count("resources/list"), 0);
        assert_eq!(server.call_count("tools/list"), 1);
        assert_eq!(server.call_count("prompts/list"), 1);
    }

    #[tokio::test]
    async fn follows_pagination_cursors() {
        let server = FakeServer::new(|method, params| {
            let cursor = params.and_then(|p| p["cursor"].as_str());
            match (method, cursor) {
                ("tools/list", None) => Reply::result(json!({
                    "tools": [{"name": "a"}, {"name": "b"}],
                    "nextCursor": "page2"
                })),
                ("tools/list", Some("page2")) => Reply::result(json!({
                    "tools": [{"name": "c"}]
                })),
                _ => Reply::error(-32601, "Method not found"),
            }
        });
        let client = server.connect();

        let cache =
            CapabilityCache::populate(&client, &capabilities(json!({"tools": {}})), TIMEOUT)
                .await
                .unwrap();

        let names: Vec<_> = cache.tools().iter().map(|t| t.name.clone()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(server.call_count("tools/list"), 2);
    }

    #[tokio::test]
    async fn repeated_cursor_ends_pagination() {
        let server = FakeServer::new(|_method, _params| {
            Reply::result(json!({"prompts": [{"name": "p"}], "nextCursor": "again"}))
        });
        let client = server.connect();

        let cache =
            CapabilityCache::populate(&client, &capabilities(json!({"prompts": {}})), TIMEOUT)
                .await
                .unwrap();

        assert_eq!(cache.prompts().len(), 1);
        assert_eq!(server.call_count("prompts/list"), 2);
    }

    #[tokio::test]
    async fn duplicates_and_malformed_entries_are_dropped() {
        let server = FakeServer::new(|_method, _params| {
            Reply::result(json!({
                "resources": [
                    {"uri": "file:///a", "name": "first"},
                    {"name": "no uri"},
                    {"uri": "file:///a", "name": "second"},
                    {"uri": "file:///b"}
                ]
            }))
        });
        let client = server.connect();

        let cache =
            CapabilityCache::populate(&client, &capabilities(json!({"resources": {}})), TIMEOUT)
                .await
                .unwrap();

        let resources = cache.resources();
        assert_eq!(resources.len(), 2);
        assert_eq!(resources[0].name.as_deref(), Some("first"));
        assert_eq!(resources[1].uri, "file:///b");
    }

    #[tokio::test]
    async fn listing_error_degrades_to_empty() {
        let caps = json!({"tools": {}, "prompts": {}});
        let server = FakeServer::new({
            let caps = caps.clone();
            move |method, params| match method {
                "tools/list" => Reply::error(-32603, "internal error"),
                _ => standard_reply(&caps, method, params),
            }
        });
        let client = server.connect();

        let cache = CapabilityCache::populate(&client, &capabilities(caps), TIMEOUT)
            .await
            .unwrap();

        assert!(cache.tools().is_empty());
        assert_eq!(cache.prompts().len(), 1);
    }

    #[tokio::test]
    async fn non_array_listing_is_invalid() {
        let server = FakeServer::new(|_method, _params| Reply::result(json!({"tools": "lots"})));
        let client = server.connect();

        assert_matches!(
            CapabilityCache::populate(&client, &capabilities(json!({"tools": {}})), TIMEOUT).await,
            Err(BridgeError::InvalidResponse { method, .. }) if method == "tools/list"
        );
    }

    #[tokio::test]
    async fn listing_timeout_fails_population() {
        let server = FakeServer::new(|_method, _params| Reply::Silent);
        let client = server.connect();

        assert_matches!(
            CapabilityCache::populate(
                &client,
                &capabilities(json!({"tools": {}})),
                Duration::from_millis(50)
            )
            .await,
            Err(BridgeError::Timeout { method, .. }) if method == "tools/list"
        );
    }
}
