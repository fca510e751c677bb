//! Constants used throughout the chat routes

use std::time::Duration;

/// Channel buffer sizes
pub const STORAGE_CHANNEL_BUFFER: usize = 1024;
pub const CLIENT_CHANNEL_BUFFER: usize = 1024;

/// Upper bound on model round-trips within one turn
pub const MAX_STEPS: usize = 5;

/// How long an upstream stream may go silent before it is abandoned
pub const UPSTREAM_CHUNK_TIMEOUT: Duration = Duration::from_secs(120);

/// Rolling entitlement window
pub const ENTITLEMENT_WINDOW_HOURS: i64 = 24;

/// A persisted assistant message younger than this is replayed on resume
pub const RESUME_SNAPSHOT_WINDOW_SECS: i64 = 15;

/// Fallback title length when title generation fails
pub const TITLE_FALLBACK_CHARS: usize = 80;

/// Model identifiers exposed to clients
pub const CHAT_MODEL: &str = "chat-model";
pub const CHAT_MODEL_REASONING: &str = "chat-model-reasoning";
pub const TITLE_MODEL: &str = "title-model";
pub const ARTIFACT_MODEL: &str = "artifact-model";

/// Cookie carrying the client's last selected model
pub const CHAT_MODEL_COOKIE: &str = "chat-model";

/// Data payload kinds
pub const DATA_APPEND_MESSAGE: &str = "append-message";
pub const DATA_USER_MESSAGE_ID: &str = "user-message-id";

/// Generic text streamed to clients when generation fails
pub const STREAM_ERROR_TEXT: &str = "Oops, an error occurred!";

/// Finish reason when upstream gives none
pub const FINISH_REASON_STOP: &str = "stop";

/// Tool names
pub const TOOL_GET_WEATHER: &str = "getWeather";
pub const TOOL_CREATE_DOCUMENT: &str = "createDocument";
pub const TOOL_UPDATE_DOCUMENT: &str = "updateDocument";
pub const TOOL_REQUEST_SUGGESTIONS: &str = "requestSuggestions";

/// Tools offered on persisted chats
pub const CHAT_TOOLS: &[&str] = &[
    TOOL_GET_WEATHER,
    TOOL_CREATE_DOCUMENT,
    TOOL_UPDATE_DOCUMENT,
    TOOL_REQUEST_SUGGESTIONS,
];
/// Tools offered on the stateless endpoint
pub const OPEN_CHAT_TOOLS: &[&str] = &[TOOL_GET_WEATHER];

/// Suggestions kept per requestSuggestions call
pub const MAX_SUGGESTIONS: usize = 5;

/// Geolocation headers set by the edge proxy
pub const HINT_LATITUDE_HEADER: &str = "x-vercel-ip-latitude";
pub const HINT_LONGITUDE_HEADER: &str = "x-vercel-ip-longitude";
pub const HINT_CITY_HEADER: &str = "x-vercel-ip-city";
pub const HINT_COUNTRY_HEADER: &str = "x-vercel-ip-country";

/// Upstream model used by the stateless endpoint when none is given
pub const OPEN_CHAT_DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Maps a client-facing model id onto the upstream model name.
pub fn provider_model_for(model_id: &str) -> Option<&'static str> {
    match model_id {
        CHAT_MODEL => Some("gpt-4o"),
        CHAT_MODEL_REASONING => Some("o3-mini"),
        TITLE_MODEL => Some("gpt-4o-mini"),
        ARTIFACT_MODEL => Some("gpt-4o-mini"),
        _ => None,
    }
}

/// Reasoning models run without tools.
pub fn is_reasoning_model(model_id: &str) -> bool {
    model_id == CHAT_MODEL_REASONING
}
