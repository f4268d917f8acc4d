//! Correlation ids carried from producer to consumer.

/// Generate a new trace id.
pub fn new_trace_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Use the caller's trace id, or mint one if it is blank.
pub fn ensure_trace_id(trace_id: &str) -> String {
    let trimmed = trace_id.trim();
    if trimmed.is_empty() {
        new_trace_id()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_trace_id() {
        assert_eq!(ensure_trace_id("abc"), "abc");
        let minted = ensure_trace_id("  ");
        assert_eq!(minted.len(), 36);
        assert_ne!(minted, ensure_trace_id(""));
    }
}
