//! Tool execution for chat generation
//!
//! Tools are advertised to the model through [`tool_definitions`] and run by
//! [`execute_tool`] when the model calls them.

use crate::db::DBConnection;
use crate::models::documents::{Document, DocumentKind, NewDocument, NewSuggestion};
use crate::provider::CompletionProvider;
use crate::web::chat::constants::{
    MAX_SUGGESTIONS, TOOL_CREATE_DOCUMENT, TOOL_GET_WEATHER, TOOL_REQUEST_SUGGESTIONS,
    TOOL_UPDATE_DOCUMENT,
};
use crate::web::chat::prompts::{
    build_document_request, build_suggestions_request, build_update_document_request,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

const WEATHER_API_BASE: &str = "https://api.open-meteo.com/v1/forecast";

/// Everything a tool may touch while running on behalf of one user.
#[derive(Clone)]
pub struct ToolContext {
    pub db: Arc<dyn DBConnection + Send + Sync>,
    pub provider: Arc<dyn CompletionProvider>,
    pub http: reqwest::Client,
    pub user_id: Uuid,
}

/// Fetch current weather from Open-Meteo
pub async fn execute_get_weather(
    http: &reqwest::Client,
    latitude: f64,
    longitude: f64,
) -> Result<Value, String> {
    trace!("Fetching weather for {}, {}", latitude, longitude);
    let response = http
        .get(WEATHER_API_BASE)
        .query(&[
            ("latitude", latitude.to_string()),
            ("longitude", longitude.to_string()),
            ("current", "temperature_2m".to_string()),
            ("hourly", "temperature_2m".to_string()),
            ("daily", "sunrise,sunset".to_string()),
            ("timezone", "auto".to_string()),
        ])
        .send()
        .await
        .map_err(|e| format!("Weather request failed: {}", e))?;

    if !response.status().is_success() {
        return Err(format!("Weather service returned {}", response.status()));
    }

    response
        .json::<Value>()
        .await
        .map_err(|e| format!("Weather response was not JSON: {}", e))
}

/// Generate a document body with the artifact model and store it
pub async fn execute_create_document(
    ctx: &ToolContext,
    title: &str,
    kind: DocumentKind,
) -> Result<Value, String> {
    info!("Creating {:?} document for user {}", kind, ctx.user_id);
    let content = ctx
        .provider
        .complete(build_document_request(title, kind))
        .await
        .map_err(|e| format!("Document generation failed: {}", e))?;

    let document = ctx
        .db
        .create_document(NewDocument {
            id: Uuid::new_v4(),
            user_id: ctx.user_id,
            title: title.to_string(),
            kind,
            content,
        })
        .map_err(|e| {
            error!("Failed to persist document: {:?}", e);
            "Failed to save document".to_string()
        })?;

    Ok(json!({
        "id": document.id,
        "title": document.title,
        "kind": document.kind,
        "content": "A document was created and is now visible to the user.",
    }))
}

/// Latest version of a document the current user owns.
fn owned_document(ctx: &ToolContext, id: Uuid) -> Result<Option<Document>, String> {
    let document = ctx.db.get_document_by_id(id).map_err(|e| {
        error!("Failed to load document {}: {:?}", id, e);
        "Failed to load document".to_string()
    })?;
    Ok(document.filter(|d| d.user_id == ctx.user_id))
}

/// Regenerate a document from a change description and store it as a new
/// version under the same id
pub async fn execute_update_document(
    ctx: &ToolContext,
    id: Uuid,
    description: &str,
) -> Result<Value, String> {
    let Some(document) = owned_document(ctx, id)? else {
        return Ok(json!({ "error": "Document not found" }));
    };
    info!("Updating document {} for user {}", id, ctx.user_id);

    let content = ctx
        .provider
        .complete(build_update_document_request(&document, description))
        .await
        .map_err(|e| format!("Document update failed: {}", e))?;

    let updated = ctx
        .db
        .create_document(NewDocument {
            id: document.id,
            user_id: ctx.user_id,
            title: document.title,
            kind: document.kind,
            content,
        })
        .map_err(|e| {
            error!("Failed to persist document version: {:?}", e);
            "Failed to save document".to_string()
        })?;

    Ok(json!({
        "id": updated.id,
        "title": updated.title,
        "kind": updated.kind,
        "content": "The document has been updated successfully.",
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SuggestionDraft {
    original_sentence: String,
    suggested_sentence: String,
    #[serde(default)]
    description: Option<String>,
}

/// Pulls the JSON array out of a completion, tolerating surrounding prose or
/// code fences. Drafts missing either sentence are skipped.
fn parse_suggestions(text: &str) -> Vec<SuggestionDraft> {
    let (Some(start), Some(end)) = (text.find('['), text.rfind(']')) else {
        return Vec::new();
    };
    if end < start {
        return Vec::new();
    }
    let items: Vec<Value> = match serde_json::from_str(&text[start..=end]) {
        Ok(items) => items,
        Err(e) => {
            warn!("Suggestions were not a JSON array: {}", e);
            return Vec::new();
        }
    };
    items
        .into_iter()
        .filter_map(|item| serde_json::from_value::<SuggestionDraft>(item).ok())
        .filter(|d| !d.original_sentence.trim().is_empty() && !d.suggested_sentence.trim().is_empty())
        .take(MAX_SUGGESTIONS)
        .collect()
}

/// Ask the artifact model for edits to a document and store them against its
/// latest version
pub async fn execute_request_suggestions(ctx: &ToolContext, id: Uuid) -> Result<Value, String> {
    let Some(document) = owned_document(ctx, id)? else {
        return Ok(json!({ "error": "Document not found" }));
    };

    let completion = ctx
        .provider
        .complete(build_suggestions_request(&document))
        .await
        .map_err(|e| format!("Suggestion generation failed: {}", e))?;
    let drafts = parse_suggestions(&completion);
    debug!("Got {} suggestion(s) for document {}", drafts.len(), id);

    let rows: Vec<NewSuggestion> = drafts
        .into_iter()
        .map(|d| NewSuggestion {
            id: Uuid::new_v4(),
            document_id: document.id,
            document_created_at: document.created_at,
            user_id: ctx.user_id,
            original_text: d.original_sentence,
            suggested_text: d.suggested_sentence,
            description: d.description,
        })
        .collect();
    if !rows.is_empty() {
        ctx.db.save_suggestions(rows).map_err(|e| {
            error!("Failed to persist suggestions: {:?}", e);
            "Failed to save suggestions".to_string()
        })?;
    }

    Ok(json!({
        "id": document.id,
        "title": document.title,
        "kind": document.kind,
        "message": "Suggestions have been added to the document",
    }))
}

fn document_id_arg(arguments: &Value, key: &str, tool: &str) -> Result<Uuid, String> {
    arguments
        .get(key)
        .and_then(Value::as_str)
        .and_then(|id| Uuid::parse_str(id).ok())
        .ok_or_else(|| format!("Missing or invalid '{}' argument for {}", key, tool))
}

/// Execute a tool by name with the given arguments
///
/// # Returns
/// * `Ok(Value)` - The tool's output, forwarded to the model and the client
/// * `Err(String)` - An error message if the tool execution failed
pub async fn execute_tool(ctx: &ToolContext, tool_name: &str, arguments: &Value) -> Result<Value, String> {
    trace!("Executing tool: {} with arguments: {}", tool_name, arguments);
    debug!("Executing tool: {}", tool_name);

    match tool_name {
        TOOL_GET_WEATHER => {
            let latitude = arguments
                .get("latitude")
                .and_then(Value::as_f64)
                .ok_or_else(|| "Missing 'latitude' argument for getWeather".to_string())?;
            let longitude = arguments
                .get("longitude")
                .and_then(Value::as_f64)
                .ok_or_else(|| "Missing 'longitude' argument for getWeather".to_string())?;
            execute_get_weather(&ctx.http, latitude, longitude).await
        }
        TOOL_CREATE_DOCUMENT => {
            let title = arguments
                .get("title")
                .and_then(Value::as_str)
                .filter(|t| !t.trim().is_empty())
                .ok_or_else(|| "Missing 'title' argument for createDocument".to_string())?;
            let kind = match arguments.get("kind").and_then(Value::as_str) {
                Some("code") => DocumentKind::Code,
                Some("text") | None => DocumentKind::Text,
                Some(other) => return Err(format!("Unsupported document kind: {}", other)),
            };
            execute_create_document(ctx, title, kind).await
        }
        TOOL_UPDATE_DOCUMENT => {
            let id = document_id_arg(arguments, "id", TOOL_UPDATE_DOCUMENT)?;
            let description = arguments
                .get("description")
                .and_then(Value::as_str)
                .filter(|d| !d.trim().is_empty())
                .ok_or_else(|| "Missing 'description' argument for updateDocument".to_string())?;
            execute_update_document(ctx, id, description).await
        }
        TOOL_REQUEST_SUGGESTIONS => {
            let id = document_id_arg(arguments, "documentId", TOOL_REQUEST_SUGGESTIONS)?;
            execute_request_suggestions(ctx, id).await
        }
        _ => {
            error!("Unknown tool requested: {}", tool_name);
            Err(format!("Unknown tool: {}", tool_name))
        }
    }
}

/// Function schemas advertised to the model, limited to `active`.
pub fn tool_definitions(active: &[&str]) -> Vec<Value> {
    let all = vec![
        json!({
            "type": "function",
            "function": {
                "name": TOOL_GET_WEATHER,
                "description": "Get the current weather at a location",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "latitude": {"type": "number"},
                        "longitude": {"type": "number"}
                    },
                    "required": ["latitude", "longitude"]
                }
            }
        }),
        json!({
            "type": "function",
            "function": {
                "name": TOOL_CREATE_DOCUMENT,
                "description": "Create a document for writing or content creation activities",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "title": {"type": "string"},
                        "kind": {"type": "string", "enum": ["text", "code"]}
                    },
                    "required": ["title", "kind"]
                }
            }
        }),
        json!({
            "type": "function",
            "function": {
                "name": TOOL_UPDATE_DOCUMENT,
                "description": "Update a document with the given description",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "id": {"type": "string", "description": "The ID of the document to update"},
                        "description": {"type": "string", "description": "The description of changes that need to be made"}
                    },
                    "required": ["id", "description"]
                }
            }
        }),
        json!({
            "type": "function",
            "function": {
                "name": TOOL_REQUEST_SUGGESTIONS,
                "description": "Request suggestions for a document",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "documentId": {"type": "string", "description": "The ID of the document to request edits"}
                    },
                    "required": ["documentId"]
                }
            }
        }),
    ];
    all.into_iter()
        .filter(|t| {
            t["function"]["name"]
                .as_str()
                .is_some_and(|name| active.contains(&name))
        })
        .collect()
}
