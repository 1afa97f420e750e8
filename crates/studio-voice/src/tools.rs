//! Tool calls exchanged with the remote service.
//!
//! The remote side names a tool and passes a loosely-typed argument object. Known
//! tools are parsed into [`StudioTool`] variants with typed arguments; anything
//! else lands in [`StudioTool::Unknown`] so newer server-side tools still reach
//! the host handler.

use crate::protocol::FunctionDeclaration;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Map, Value};

pub const MANAGE_CALENDAR: &str = "manage_calendar";
pub const ORGANIZE_PHOTOS: &str = "organize_photos";
pub const CONNECT_CLOUD: &str = "connect_cloud";

/// A tool invocation request as received from the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: Map<String, Value>,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, args: Value) -> Self {
        let args = match args {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            id: id.into(),
            name: name.into(),
            args,
        }
    }
}

/// Arguments for `manage_calendar`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarEvent {
    #[serde(default)]
    pub project_name: Option<String>,
    pub event_title: String,
}

/// Arguments for `organize_photos`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhotoArchive {
    #[serde(deserialize_with = "whole_number")]
    pub count: u32,
    pub path: String,
}

/// Typed view over the tools the studio exposes.
#[derive(Debug, Clone, PartialEq)]
pub enum StudioTool {
    ManageCalendar(CalendarEvent),
    OrganizePhotos(PhotoArchive),
    ConnectCloud,
    /// Tool name this build does not know about.
    Unknown { name: String, args: Map<String, Value> },
}

impl StudioTool {
    /// Parse a call into its typed form. A known tool with malformed arguments
    /// is an error; an unknown name is not.
    pub fn from_call(call: &ToolCall) -> Result<Self, serde_json::Error> {
        let args = Value::Object(call.args.clone());
        let tool = match call.name.as_str() {
            MANAGE_CALENDAR => StudioTool::ManageCalendar(serde_json::from_value(args)?),
            ORGANIZE_PHOTOS => StudioTool::OrganizePhotos(serde_json::from_value(args)?),
            CONNECT_CLOUD => StudioTool::ConnectCloud,
            other => StudioTool::Unknown {
                name: other.to_string(),
                args: call.args.clone(),
            },
        };
        Ok(tool)
    }

    pub fn name(&self) -> &str {
        match self {
            StudioTool::ManageCalendar(_) => MANAGE_CALENDAR,
            StudioTool::OrganizePhotos(_) => ORGANIZE_PHOTOS,
            StudioTool::ConnectCloud => CONNECT_CLOUD,
            StudioTool::Unknown { name, .. } => name.as_str(),
        }
    }
}

/// Accepts `12` as well as `12.0`; the remote schema only knows "NUMBER".
fn whole_number<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let n = f64::deserialize(deserializer)?;
    if n.fract() != 0.0 || n < 0.0 || n > u32::MAX as f64 {
        return Err(serde::de::Error::custom(format!("expected a non-negative whole number, got {}", n)));
    }
    Ok(n as u32)
}

/// Outcome carried by a [`ToolResult`].
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    Success(Value),
    Failure(String),
}

/// The single answer owed for one [`ToolCall`].
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub id: String,
    pub name: String,
    pub outcome: ToolOutcome,
}

impl ToolResult {
    pub fn success(call: &ToolCall, value: Value) -> Self {
        Self {
            id: call.id.clone(),
            name: call.name.clone(),
            outcome: ToolOutcome::Success(value),
        }
    }

    pub fn failure(call: &ToolCall, message: impl Into<String>) -> Self {
        Self {
            id: call.id.clone(),
            name: call.name.clone(),
            outcome: ToolOutcome::Failure(message.into()),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.outcome, ToolOutcome::Failure(_))
    }

    /// Body of the `response` field on the wire.
    pub fn response_payload(&self) -> Value {
        match &self.outcome {
            ToolOutcome::Success(Value::Null) => json!({ "result": "ok" }),
            ToolOutcome::Success(value) => value.clone(),
            ToolOutcome::Failure(message) => json!({ "error": message }),
        }
    }
}

/// Function declarations announced to the remote service during setup.
pub fn tool_declarations() -> Vec<FunctionDeclaration> {
    vec![
        FunctionDeclaration {
            name: MANAGE_CALENDAR.to_string(),
            description: "Schedule a project event in the calendar.".to_string(),
            parameters: json!({
                "type": "OBJECT",
                "properties": {
                    "projectName": { "type": "STRING", "description": "The name of the project." },
                    "eventTitle": { "type": "STRING", "description": "The title of the event." }
                },
                "required": ["projectName", "eventTitle"]
            }),
        },
        FunctionDeclaration {
            name: ORGANIZE_PHOTOS.to_string(),
            description: "Archive photos to a specific project folder.".to_string(),
            parameters: json!({
                "type": "OBJECT",
                "properties": {
                    "count": { "type": "NUMBER", "description": "Number of photos to archive." },
                    "path": { "type": "STRING", "description": "Destination folder path." }
                },
                "required": ["count", "path"]
            }),
        },
        FunctionDeclaration {
            name: CONNECT_CLOUD.to_string(),
            description: "Connect to Google Workspace cloud services.".to_string(),
            parameters: json!({ "type": "OBJECT", "properties": {} }),
        },
    ]
}
