//! Residual-PHI scan: after a script runs, remaining string values are
//! checked against known identifier shapes. Hits are warnings in the audit
//! report, never failures.

use once_cell::sync::Lazy;
use regex::Regex;

static SSN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").expect("ssn regex"));
static PHONE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:\+?1[-. ]?)?\(?\d{3}\)?[-. ]\d{3}[-. ]\d{4}\b").expect("phone regex"));
static EMAIL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b").expect("email regex"));

/// Scanner with the built-in patterns plus site-configured MRN shapes.
pub struct PhiScanner {
    mrn_patterns: Vec<Regex>,
}

impl PhiScanner {
    pub fn new(mrn_patterns: &[String]) -> Self {
        let mrn_patterns = mrn_patterns
            .iter()
            .filter_map(|p| match Regex::new(p) {
                Ok(re) => Some(re),
                Err(e) => {
                    tracing::warn!(pattern = %p, error = %e, "invalid MRN pattern, skipping");
                    None
                }
            })
            .collect();
        Self { mrn_patterns }
    }

    /// Returns the pattern names that match the value.
    pub fn scan(&self, value: &str) -> Vec<&'static str> {
        let mut hits = Vec::new();
        if SSN.is_match(value) {
            hits.push("ssn");
        }
        if PHONE.is_match(value) {
            hits.push("phone");
        }
        if EMAIL.is_match(value) {
            hits.push("email");
        }
        if self.mrn_patterns.iter().any(|re| re.is_match(value)) {
            hits.push("mrn");
        }
        hits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_patterns() {
        let scanner = PhiScanner::new(&[]);
        assert_eq!(scanner.scan("ssn 123-45-6789 leaked"), vec!["ssn"]);
        assert_eq!(scanner.scan("call (555) 867-5309"), vec!["phone"]);
        assert_eq!(scanner.scan("mail: jane.doe@example.org"), vec!["email"]);
        assert!(scanner.scan("CHEST PA AND LATERAL").is_empty());
    }

    #[test]
    fn test_site_mrn_pattern() {
        let scanner = PhiScanner::new(&[r"\bMRN\d{7}\b".to_string()]);
        assert_eq!(scanner.scan("id MRN1234567"), vec!["mrn"]);
        assert!(scanner.scan("MRN12").is_empty());
    }

    #[test]
    fn test_invalid_pattern_skipped() {
        let scanner = PhiScanner::new(&["([unclosed".to_string()]);
        assert!(scanner.scan("anything").is_empty());
    }
}
