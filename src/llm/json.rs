//! Tolerant JSON extraction from model output.

/// Extract a JSON object from LLM output (handles markdown wrapping).
pub(crate) fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    // Already a JSON object
    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    // Wrapped in a ```json code block
    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    // Wrapped in a bare code block
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('{') {
                return inner.to_string();
            }
        }
    }

    // Find object bounds inside surrounding prose
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_object_passes_through() {
        let input = r#"{"rule_id": "abc"}"#;
        assert_eq!(extract_json_object(input), input);
    }

    #[test]
    fn markdown_block_is_unwrapped() {
        let input = "```json\n{\"verdict\": true}\n```";
        let result = extract_json_object(input);
        assert!(result.starts_with('{'));
        assert!(result.contains("verdict"));
    }

    #[test]
    fn object_embedded_in_prose() {
        let input = "My decision: {\"rule_id\": null} based on the content.";
        let result = extract_json_object(input);
        assert!(result.starts_with('{'));
        assert!(result.ends_with('}'));
    }

    #[test]
    fn plain_text_returned_as_is() {
        assert_eq!(extract_json_object("no json here"), "no json here");
    }
}
