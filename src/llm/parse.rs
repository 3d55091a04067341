/// Best-effort extraction of a JSON object from untrusted model output.
/// Handles Markdown fences (```json ... ``` or ``` ... ```) and, failing
/// that, takes the span from the first `{` to the last `}`.
pub fn extract_json(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.starts_with("```") {
        let mut inner = trimmed;
        if let Some(after_first) = inner.splitn(2, '\n').nth(1) {
            inner = after_first;
        }
        if let Some(end) = inner.rfind("```") {
            inner = &inner[..end];
        }
        return Some(inner.trim().to_string());
    }

    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    Some(trimmed[start..=end].trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passes_bare_json_through() {
        let body = "{\"percentage\": 45}";
        assert_eq!(extract_json(body), Some(body.to_string()));
    }

    #[test]
    fn strips_fenced_blocks() {
        let body = "{\"is_expiry_date_shown\":true}";
        let fenced = format!("```json\n{body}\n```\n");
        assert_eq!(extract_json(&fenced), Some(body.to_string()));
    }

    #[test]
    fn strips_fences_without_language_tag() {
        let body = "{\"confidence\":0.8}";
        let fenced = format!("```\n{body}\n```");
        assert_eq!(extract_json(&fenced), Some(body.to_string()));
    }

    #[test]
    fn falls_back_to_brace_span() {
        let s = "Sure! Here is the JSON you asked for: {\"percentage\": 52} Hope that helps.";
        assert_eq!(extract_json(s), Some("{\"percentage\": 52}".to_string()));
    }

    #[test]
    fn rejects_text_without_an_object() {
        assert_eq!(extract_json("the label is unreadable"), None);
    }
}
