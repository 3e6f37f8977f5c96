use serde_json::Value;

/// Extract every observation carried by an ingestion event.
///
/// An event is either a single entry object or an array of entries. Each entry
/// contributes the first present text field (see [`observation_from_entry`])
/// plus one observation per string in an optional `contents` array.
pub fn extract_observations(event: &Value) -> Vec<String> {
    match event {
        Value::Array(entries) => entries.iter().flat_map(entry_observations).collect(),
        Value::Object(_) => entry_observations(event),
        _ => Vec::new(),
    }
}

fn entry_observations(entry: &Value) -> Vec<String> {
    let mut observations = Vec::new();
    if let Some(text) = observation_from_entry(entry) {
        observations.push(text);
    }
    if let Some(Value::Array(contents)) = entry.get("contents") {
        observations.extend(
            contents
                .iter()
                .filter_map(Value::as_str)
                .filter(|s| !s.trim().is_empty())
                .map(str::to_string),
        );
    }
    observations
}

/// Return the first present observation field of a single entry.
///
/// Lookup order: `observation_content` (or `observationContent`),
/// `payload.description`, `payload.error`, `payload.observation`, `error`.
/// Error fields are prefixed with `Error: `.
pub fn observation_from_entry(entry: &Value) -> Option<String> {
    let direct = entry
        .get("observation_content")
        .or_else(|| entry.get("observationContent"))
        .and_then(text_of);
    if direct.is_some() {
        return direct;
    }

    if let Some(payload) = entry.get("payload").filter(|p| p.is_object()) {
        if let Some(text) = payload.get("description").and_then(text_of) {
            return Some(text);
        }
        if let Some(text) = payload.get("error").and_then(text_of) {
            return Some(format!("Error: {text}"));
        }
        if let Some(text) = payload.get("observation").and_then(text_of) {
            return Some(text);
        }
    }

    entry
        .get("error")
        .and_then(text_of)
        .map(|text| format!("Error: {text}"))
}

fn text_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Null | Value::String(_) => None,
        other => Some(other.to_string()),
    }
}
