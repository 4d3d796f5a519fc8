use std::collections::HashMap;

/// Render a `{Keyword}` template over extracted tag values. Unknown
/// placeholders render as `UNKNOWN`; values are sanitized so they cannot
/// escape the destination directory.
pub fn render_pattern(pattern: &str, tags: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(pattern.len());
    let mut rest = pattern;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('}') {
            Some(end) => {
                let key = &after[..end];
                let value = tags
                    .get(key)
                    .map(String::as_str)
                    .filter(|v| !v.is_empty())
                    .unwrap_or("UNKNOWN");
                out.push_str(&sanitize_component(value));
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                return out;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Keep a tag value usable as a single path component.
pub fn sanitize_component(value: &str) -> String {
    let cleaned: String = value
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | '\0' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    if cleaned == ".." || cleaned == "." || cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_render_pattern() {
        let t = tags(&[("PatientID", "P12345"), ("StudyDate", "20260115")]);
        assert_eq!(
            render_pattern("{PatientID}/{StudyDate}", &t),
            "P12345/20260115"
        );
    }

    #[test]
    fn test_unknown_placeholder() {
        let t = tags(&[]);
        assert_eq!(render_pattern("{PatientID}/x", &t), "UNKNOWN/x");
    }

    #[test]
    fn test_sanitizes_separators() {
        let t = tags(&[("PatientID", "../evil/p")]);
        let rendered = render_pattern("{PatientID}", &t);
        assert!(!rendered.contains('/'));
        assert!(!rendered.contains(".."));
    }

    #[test]
    fn test_unclosed_brace_passes_through() {
        let t = tags(&[]);
        assert_eq!(render_pattern("a{Unclosed", &t), "a{Unclosed");
    }
}
