//! Prompt templates for chat generation, titles and documents

use crate::models::documents::{Document, DocumentKind};
use crate::provider::CompletionRequest;
use crate::web::chat::constants::{
    is_reasoning_model, provider_model_for, ARTIFACT_MODEL, HINT_CITY_HEADER, HINT_COUNTRY_HEADER,
    HINT_LATITUDE_HEADER, HINT_LONGITUDE_HEADER, TITLE_MODEL,
};
use axum::http::HeaderMap;
use serde_json::json;

pub const REGULAR_PROMPT: &str =
    "You are a friendly assistant! Keep your responses concise and helpful.";

/// Appended for models that may call tools.
pub const TOOLS_PROMPT: &str = "\
You can call tools when they help answer the user:
- getWeather returns current conditions for a latitude and longitude. Use it when asked about the weather.
- createDocument writes a standalone text or code document for substantial content (essays, emails, code snippets). \
Do not use it for short conversational answers, and do not repeat the document contents back after creating it.
- updateDocument rewrites an existing document following the user's description of the change. \
Only use it after the user asks for changes to a document, never right after creating one.
- requestSuggestions proposes edits for an existing document when the user asks for feedback on it.";

pub const TITLE_PROMPT: &str = "\
You will generate a short title based on the first message a user begins a conversation with.
Ensure it is not more than 80 characters long.
The title should be a summary of the user's message.
Do not use quotes or colons.";

pub const TEXT_DOCUMENT_PROMPT: &str = "\
Write about the given topic. Markdown is supported. Use headings wherever appropriate.";

pub const CODE_DOCUMENT_PROMPT: &str = "\
You are a code generator that creates self-contained, executable code snippets.
Each snippet should be complete and runnable on its own, include helpful comments,
keep to about 15 lines, and avoid external dependencies, input() calls and network access.
Return only the code.";

pub const UPDATE_DOCUMENT_PROMPT: &str = "\
Improve the following contents of the document based on the given prompt. Return only the new contents.";

pub const SUGGESTIONS_PROMPT: &str = "\
You are a helpful writing assistant. Given a piece of writing, offer suggestions to improve it and describe each change.
Edits must contain full sentences, not single words. Give at most 5 suggestions.
Respond with a JSON array only, where each element is an object with the string fields \
originalSentence, suggestedSentence and description.";

/// Where a request came from, as reported by the edge proxy.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestHints {
    pub latitude: Option<String>,
    pub longitude: Option<String>,
    pub city: Option<String>,
    pub country: Option<String>,
}

impl RequestHints {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let read = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(ToString::to_string)
        };
        Self {
            latitude: read(HINT_LATITUDE_HEADER),
            longitude: read(HINT_LONGITUDE_HEADER),
            city: read(HINT_CITY_HEADER),
            country: read(HINT_COUNTRY_HEADER),
        }
    }

    /// Prompt section describing the origin; `None` when nothing is known.
    fn prompt(&self) -> Option<String> {
        let lines: Vec<String> = [
            ("lat", &self.latitude),
            ("lon", &self.longitude),
            ("city", &self.city),
            ("country", &self.country),
        ]
        .into_iter()
        .filter_map(|(label, value)| value.as_deref().map(|v| format!("- {}: {}", label, v)))
        .collect();
        if lines.is_empty() {
            return None;
        }
        Some(format!(
            "About the origin of user's request:\n{}",
            lines.join("\n")
        ))
    }
}

/// System prompt for the selected chat model.
pub fn system_prompt(selected_chat_model: &str, hints: &RequestHints) -> String {
    let mut sections = vec![REGULAR_PROMPT.to_string()];
    sections.extend(hints.prompt());
    if !is_reasoning_model(selected_chat_model) {
        sections.push(TOOLS_PROMPT.to_string());
    }
    sections.join("\n\n")
}

pub fn build_title_request(user_text: &str) -> CompletionRequest {
    CompletionRequest {
        model: provider_model_for(TITLE_MODEL).unwrap_or("gpt-4o-mini").to_string(),
        messages: vec![
            json!({"role": "system", "content": TITLE_PROMPT}),
            json!({"role": "user", "content": user_text}),
        ],
        tools: vec![],
        web_search: false,
    }
}

pub fn build_document_request(title: &str, kind: DocumentKind) -> CompletionRequest {
    let system = match kind {
        DocumentKind::Text => TEXT_DOCUMENT_PROMPT,
        DocumentKind::Code => CODE_DOCUMENT_PROMPT,
    };
    artifact_request(system.to_string(), title)
}

fn artifact_request(system: String, user: &str) -> CompletionRequest {
    CompletionRequest {
        model: provider_model_for(ARTIFACT_MODEL).unwrap_or("gpt-4o-mini").to_string(),
        messages: vec![
            json!({"role": "system", "content": system}),
            json!({"role": "user", "content": user}),
        ],
        tools: vec![],
        web_search: false,
    }
}

/// Rewrites `document` following `description`.
pub fn build_update_document_request(document: &Document, description: &str) -> CompletionRequest {
    let system = match document.kind {
        DocumentKind::Text => format!("{}\n\n{}", UPDATE_DOCUMENT_PROMPT, document.content),
        DocumentKind::Code => format!(
            "{}\n{}\n\n{}",
            UPDATE_DOCUMENT_PROMPT, CODE_DOCUMENT_PROMPT, document.content
        ),
    };
    artifact_request(system, description)
}

pub fn build_suggestions_request(document: &Document) -> CompletionRequest {
    artifact_request(SUGGESTIONS_PROMPT.to_string(), &document.content)
}
