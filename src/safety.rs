//! Local redaction: blocklisted terms and leaked secrets/PII.
//!
//! Runs without any provider, so the orchestrator can always produce a
//! redacted body even when the LLM reviewer is unreachable.

use regex::Regex;

pub const REDACTED: &str = "[REDACTED]";

/// Terms that must never leave the building.
pub fn default_blocklist() -> Vec<String> {
    vec!["mot_interdit1".to_string(), "secret-confidentiel".to_string()]
}

/// A pattern for something that looks like a leaked secret.
struct LeakPattern {
    name: &'static str,
    regex: Regex,
}

/// Finds and scrubs secrets and personal data.
pub struct LeakDetector {
    patterns: Vec<LeakPattern>,
}

impl LeakDetector {
    pub fn new() -> Self {
        let patterns = vec![
            LeakPattern {
                name: "card number",
                regex: Regex::new(r"\b(?:\d[ -]?){13,16}\b").unwrap(),
            },
            LeakPattern {
                name: "IBAN",
                regex: Regex::new(r"\b[A-Z]{2}\d{2}(?:\s?[A-Z0-9]{4}){3,7}(?:\s?[A-Z0-9]{1,3})?\b").unwrap(),
            },
            LeakPattern {
                name: "API key",
                regex: Regex::new(r"\b(?:sk|pk|rk)[-_][A-Za-z0-9_-]{16,}\b").unwrap(),
            },
            LeakPattern {
                name: "password",
                regex: Regex::new(r"(?i)\b(?:password|mot de passe|passwd)\s*[:=]\s*\S+").unwrap(),
            },
        ];
        Self { patterns }
    }

    /// Names of the leak kinds found in `content`.
    pub fn detect(&self, content: &str) -> Vec<&'static str> {
        self.patterns
            .iter()
            .filter(|p| p.regex.is_match(content))
            .map(|p| p.name)
            .collect()
    }

    pub fn scrub(&self, content: &str) -> String {
        self.patterns.iter().fold(content.to_string(), |acc, p| {
            p.regex.replace_all(&acc, REDACTED).into_owned()
        })
    }
}

impl Default for LeakDetector {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of a local safety scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanResult {
    pub issues: Vec<String>,
    pub redacted: String,
}

impl ScanResult {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Blocklist + leak detection.
pub struct SafetyLayer {
    blocklist: Vec<(String, Regex)>,
    leaks: LeakDetector,
}

impl SafetyLayer {
    pub fn new() -> Self {
        Self::with_blocklist(default_blocklist())
    }

    pub fn with_blocklist(terms: Vec<String>) -> Self {
        let blocklist = terms
            .into_iter()
            .filter(|t| !t.trim().is_empty())
            .filter_map(|term| {
                Regex::new(&format!("(?i){}", regex::escape(&term)))
                    .ok()
                    .map(|re| (term, re))
            })
            .collect();
        Self {
            blocklist,
            leaks: LeakDetector::new(),
        }
    }

    /// Scan `content`, reporting each problem and returning a scrubbed copy.
    pub fn scan(&self, content: &str) -> ScanResult {
        let mut issues = Vec::new();
        let mut redacted = content.to_string();

        for (term, re) in &self.blocklist {
            if re.is_match(&redacted) {
                issues.push(format!("Forbidden term: {term}"));
                redacted = re.replace_all(&redacted, REDACTED).into_owned();
            }
        }

        for name in self.leaks.detect(&redacted) {
            issues.push(format!("Sensitive data: {name}"));
        }
        redacted = self.leaks.scrub(&redacted);

        ScanResult { issues, redacted }
    }

    /// Scrubbed copy only.
    pub fn redact(&self, content: &str) -> String {
        self.scan(content).redacted
    }
}

impl Default for SafetyLayer {
    fn default() -> Self {
        Self::new()
    }
}
