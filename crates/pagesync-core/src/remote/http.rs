use super::{RemoteError, RemotePage, RemoteStore};
use crate::blocks::{ParentRef, SyncedBlock};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::debug;

pub const MAX_PAGE_SIZE: usize = 100;

/// Blocking ureq client for the block API. Each request runs on tokio's blocking pool.
#[derive(Clone)]
pub struct HttpRemote {
    agent: ureq::Agent,
    base_url: String,
    token: String,
    api_version: String,
    page_size: usize,
}

impl HttpRemote {
    pub fn new(
        base_url: impl Into<String>,
        token: impl Into<String>,
        api_version: impl Into<String>,
        page_size: usize,
    ) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(30))
            .build();
        Self {
            agent,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            api_version: api_version.into(),
            page_size: page_size.clamp(1, MAX_PAGE_SIZE),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn request(&self, method: &str, path: &str) -> ureq::Request {
        self.agent
            .request(method, &self.url(path))
            .set("Authorization", &format!("Bearer {}", self.token))
            .set("Notion-Version", &self.api_version)
    }

    fn send(&self, method: &str, path: &str, body: Option<Value>) -> Result<Value, RemoteError> {
        debug!(method, path, "remote request");
        let request = self.request(method, path);
        let result = match body {
            Some(body) => request.send_json(body),
            None => request.call(),
        };
        match result {
            Ok(response) => Ok(response.into_json::<Value>()?),
            Err(ureq::Error::Status(status, response)) => {
                let raw = response.into_string().unwrap_or_default();
                let message = serde_json::from_str::<Value>(&raw)
                    .ok()
                    .and_then(|value| value.get("message")?.as_str().map(str::to_string))
                    .unwrap_or(raw);
                Err(RemoteError::Http { status, message })
            }
            Err(ureq::Error::Transport(transport)) => {
                Err(RemoteError::Transport(transport.to_string()))
            }
        }
    }

    async fn call(
        &self,
        method: &'static str,
        path: String,
        body: Option<Value>,
    ) -> Result<Value, RemoteError> {
        let client = self.clone();
        tokio::task::spawn_blocking(move || client.send(method, &path, body))
            .await
            .map_err(|err| RemoteError::Task(err.to_string()))?
    }
}

#[async_trait]
impl RemoteStore for HttpRemote {
    async fn create(
        &self,
        parent_id: &str,
        children: Vec<Value>,
        anchor: Option<&str>,
    ) -> Result<Vec<String>, RemoteError> {
        let mut body = json!({ "children": children });
        if let Some(anchor) = anchor {
            body["after"] = json!(anchor);
        }
        let response = self
            .call("PATCH", format!("blocks/{parent_id}/children"), Some(body))
            .await?;
        let results = response
            .get("results")
            .and_then(Value::as_array)
            .ok_or_else(|| RemoteError::Decode("create response has no results".to_string()))?;
        results
            .iter()
            .map(|result| {
                result
                    .get("id")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| RemoteError::Decode("created block has no id".to_string()))
            })
            .collect()
    }

    async fn update(&self, id: &str, block: Value) -> Result<(), RemoteError> {
        self.call("PATCH", format!("blocks/{id}"), Some(update_body(&block)))
            .await?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), RemoteError> {
        self.call("DELETE", format!("blocks/{id}"), None).await?;
        Ok(())
    }

    async fn fetch_page(&self, id: &str) -> Result<RemotePage, RemoteError> {
        let value = self.call("GET", format!("pages/{id}"), None).await?;
        page_from_wire(&value)
    }

    async fn fetch_children(&self, id: &str) -> Result<Vec<SyncedBlock>, RemoteError> {
        let mut blocks = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let mut path = format!("blocks/{id}/children?page_size={}", self.page_size);
            if let Some(cursor) = &cursor {
                path.push_str("&start_cursor=");
                path.push_str(cursor);
            }
            let page = self.call("GET", path, None).await?;
            if let Some(results) = page.get("results").and_then(Value::as_array) {
                blocks.extend(results.iter().filter_map(SyncedBlock::from_wire));
            }
            let has_more = page
                .get("has_more")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            cursor = page
                .get("next_cursor")
                .and_then(Value::as_str)
                .map(str::to_string);
            if !has_more || cursor.is_none() {
                break;
            }
        }
        debug!(page_id = id, count = blocks.len(), "fetched children");
        Ok(blocks)
    }
}

/// The update endpoint only accepts the type payload keyed by type name.
fn update_body(block: &Value) -> Value {
    let mut body = Map::new();
    if let Some(type_name) = block.get("type").and_then(Value::as_str) {
        if let Some(payload) = block.get(type_name) {
            body.insert(type_name.to_string(), payload.clone());
        }
    }
    Value::Object(body)
}

fn page_from_wire(value: &Value) -> Result<RemotePage, RemoteError> {
    let id = value
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| RemoteError::Decode("page has no id".to_string()))?
        .to_string();
    let title = value
        .get("properties")
        .and_then(Value::as_object)
        .and_then(|properties| {
            properties
                .values()
                .find(|property| property.get("type").and_then(Value::as_str) == Some("title"))
        })
        .and_then(|property| property.get("title")?.as_array().cloned())
        .map(|runs| {
            runs.iter()
                .filter_map(|run| run.get("plain_text").and_then(Value::as_str))
                .collect::<String>()
        })
        .unwrap_or_default();
    let icon = value
        .pointer("/icon/emoji")
        .and_then(Value::as_str)
        .map(str::to_string);
    let parent = match value.get("parent") {
        Some(parent) => {
            let type_name = parent.get("type").and_then(Value::as_str).unwrap_or("");
            let id = parent
                .get(type_name)
                .and_then(Value::as_str)
                .map(str::to_string);
            ParentRef::from_parts(type_name.trim_end_matches("_id"), id)
        }
        None => ParentRef::Workspace,
    };
    Ok(RemotePage {
        id,
        title,
        icon,
        parent,
        last_edited_time: value
            .get("last_edited_time")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}
