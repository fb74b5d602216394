use crate::protocol::openai::Message;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub const DEFAULT_UPSTREAM_MODEL: &str = "GLM-4-6-API-V1";

/// Maps the public model name to the id the upstream expects.
pub fn upstream_model_id(model_name: &str) -> &'static str {
    match model_name {
        "GLM-4.6" => DEFAULT_UPSTREAM_MODEL,
        other => {
            tracing::debug!(model = other, "unknown model name, using GLM-4.6");
            DEFAULT_UPSTREAM_MODEL
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UpstreamRequest {
    pub stream: bool,
    pub model: String,
    pub messages: Vec<Message>,
    pub params: Map<String, Value>,
    pub features: Features,
    pub background_tasks: BackgroundTasks,
    pub chat_id: String,
    pub id: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub mcp_servers: Vec<String>,
    pub model_item: ModelItem,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tool_servers: Vec<String>,
    pub variables: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct Features {
    pub enable_thinking: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct BackgroundTasks {
    pub title_generation: bool,
    pub tags_generation: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelItem {
    pub id: String,
    pub name: String,
    pub owned_by: String,
}

/// Per-request identifiers for one upstream conversation.
#[derive(Debug, Clone)]
pub struct ChatIds {
    pub chat_id: String,
    pub message_id: String,
}

impl ChatIds {
    pub fn generate() -> Self {
        let now = chrono::Utc::now();
        let nanos = now.timestamp_nanos_opt().unwrap_or_default();
        Self {
            chat_id: format!("{}-{}", nanos, now.timestamp()),
            message_id: nanos.to_string(),
        }
    }
}

impl UpstreamRequest {
    /// Upstream is always asked to stream; non-streaming callers are served
    /// by aggregating the stream locally.
    pub fn build(
        model_name: &str,
        messages: Vec<Message>,
        enable_thinking: bool,
        ids: &ChatIds,
        now: chrono::DateTime<chrono::Local>,
    ) -> Self {
        let upstream_model = upstream_model_id(model_name).to_string();
        let mut variables = BTreeMap::new();
        variables.insert("{{USER_NAME}}".to_string(), "User".to_string());
        variables.insert("{{USER_LOCATION}}".to_string(), "Unknown".to_string());
        variables.insert(
            "{{CURRENT_DATETIME}}".to_string(),
            now.format("%Y-%m-%d %H:%M:%S").to_string(),
        );
        Self {
            stream: true,
            model: upstream_model.clone(),
            messages,
            params: Map::new(),
            features: Features { enable_thinking },
            background_tasks: BackgroundTasks::default(),
            chat_id: ids.chat_id.clone(),
            id: ids.message_id.clone(),
            mcp_servers: Vec::new(),
            model_item: ModelItem {
                id: upstream_model,
                name: model_name.to_string(),
                owned_by: "openai".to_string(),
            },
            tool_servers: Vec::new(),
            variables,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpstreamSseEvent {
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub data: Option<UpstreamEventData>,
    #[serde(default)]
    pub error: Option<UpstreamErrorObject>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpstreamEventData {
    #[serde(default)]
    pub delta_content: Option<String>,
    #[serde(default)]
    pub phase: Option<String>,
    #[serde(default)]
    pub done: Option<bool>,
    #[serde(default)]
    pub error: Option<UpstreamErrorObject>,
    #[serde(default)]
    pub data: Option<NestedEventData>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NestedEventData {
    #[serde(default)]
    pub error: Option<UpstreamErrorObject>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpstreamErrorObject {
    #[serde(default)]
    pub detail: Option<String>,
    #[serde(default)]
    pub code: Option<Value>,
}

type ErrorLocator = for<'a> fn(&'a UpstreamSseEvent) -> Option<&'a UpstreamErrorObject>;

fn top_level_error(event: &UpstreamSseEvent) -> Option<&UpstreamErrorObject> {
    event.error.as_ref()
}

fn data_error(event: &UpstreamSseEvent) -> Option<&UpstreamErrorObject> {
    event.data.as_ref()?.error.as_ref()
}

fn nested_data_error(event: &UpstreamSseEvent) -> Option<&UpstreamErrorObject> {
    event.data.as_ref()?.data.as_ref()?.error.as_ref()
}

/// Places an error object may appear in, checked in order.
const ERROR_LOCATIONS: [ErrorLocator; 3] = [top_level_error, data_error, nested_data_error];

impl UpstreamSseEvent {
    pub fn embedded_error(&self) -> Option<&UpstreamErrorObject> {
        ERROR_LOCATIONS.iter().find_map(|locate| locate(self))
    }

    pub fn phase(&self) -> &str {
        self.data
            .as_ref()
            .and_then(|d| d.phase.as_deref())
            .unwrap_or("")
    }

    pub fn delta_content(&self) -> &str {
        self.data
            .as_ref()
            .and_then(|d| d.delta_content.as_deref())
            .unwrap_or("")
    }

    pub fn is_done(&self) -> bool {
        let done_flag = self.data.as_ref().and_then(|d| d.done).unwrap_or(false);
        done_flag || self.phase() == "done"
    }
}

#[derive(Debug, Deserialize)]
pub struct AnonymousAuthResponse {
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct UpstreamModelList {
    #[serde(default)]
    pub data: Vec<UpstreamModel>,
}

#[derive(Debug, Deserialize)]
pub struct UpstreamModel {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
}

impl UpstreamModel {
    pub fn display_id(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}
