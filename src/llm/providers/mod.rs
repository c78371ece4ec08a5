pub mod ollama;
pub mod remote;

/// Pulls the SQL or JSON payload out of a model response that may wrap it in
/// markdown code fences. Falls back to the raw content when no fence is
/// found; callers validate the result anyway.
pub fn extract_fenced(content: &str) -> String {
    for marker in ["```sql", "```json", "```"] {
        if let Some(start) = content.find(marker) {
            let after = &content[start + marker.len()..];
            if let Some(end) = after.find("```") {
                return after[..end].trim().to_string();
            }
        }
    }
    content.trim().to_string()
}
