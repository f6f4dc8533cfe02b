// content.rs: Sensitive and malicious content detection.
//
// Request content is scanned for two families of patterns:
//
//   - sensitive: social security numbers, e-mail addresses, credential-like
//     assignments (api_key=..., token: ...), payment-card digit groups;
//   - malicious: command injection, SQL injection, script injection.
//
// The detector only reports *which* families matched. What a match costs is
// decided by the risk scorer; what it blocks is decided by policy rules
// (`content_clean: true`).

use regex::Regex;
use serde::{Deserialize, Serialize};

/// One pattern family that matched.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ContentFinding {
    SocialSecurityNumber,
    EmailAddress,
    Credential,
    PaymentCard,
    CommandInjection,
    SqlInjection,
    ScriptInjection,
}

impl ContentFinding {
    pub fn is_malicious(self) -> bool {
        matches!(
            self,
            ContentFinding::CommandInjection
                | ContentFinding::SqlInjection
                | ContentFinding::ScriptInjection
        )
    }
}

/// Result of scanning a piece of content.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentScan {
    pub findings: Vec<ContentFinding>,
}

impl ContentScan {
    pub fn has_sensitive(&self) -> bool {
        self.findings.iter().any(|f| !f.is_malicious())
    }

    pub fn has_malicious(&self) -> bool {
        self.findings.iter().any(|f| f.is_malicious())
    }

    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }
}

const PATTERNS: &[(ContentFinding, &str)] = &[
    (ContentFinding::SocialSecurityNumber, r"\b\d{3}-\d{2}-\d{4}\b"),
    (
        ContentFinding::EmailAddress,
        r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b",
    ),
    (
        ContentFinding::Credential,
        r#"(?i)(api[_-]?key|token|secret|password)["\s]*[:=]["\s]*[A-Za-z0-9]{20,}"#,
    ),
    (
        ContentFinding::PaymentCard,
        r"\b\d{4}[\s-]?\d{4}[\s-]?\d{4}[\s-]?\d{4}\b",
    ),
    (
        ContentFinding::CommandInjection,
        r"(?i)(rm\s+-rf|del\s+/|format\s+c:|\bshutdown\b|\breboot\b)",
    ),
    (
        ContentFinding::SqlInjection,
        r"(?i)(drop\s+table|delete\s+from|\btruncate\b|alter\s+table)",
    ),
    (
        ContentFinding::ScriptInjection,
        r"(?i)(<script|javascript:|eval\(|exec\()",
    ),
];

/// Compiled content patterns.
#[derive(Debug, Clone)]
pub struct ContentDetector {
    patterns: Vec<(ContentFinding, Regex)>,
}

impl ContentDetector {
    pub fn new() -> Result<Self, regex::Error> {
        let patterns = PATTERNS
            .iter()
            .map(|(finding, pattern)| Ok((*finding, Regex::new(pattern)?)))
            .collect::<Result<Vec<_>, regex::Error>>()?;
        Ok(Self { patterns })
    }

    /// Scan `content`. `None` and empty content are clean.
    pub fn scan(&self, content: Option<&str>) -> ContentScan {
        let Some(content) = content.filter(|c| !c.is_empty()) else {
            return ContentScan::default();
        };
        ContentScan {
            findings: self
                .patterns
                .iter()
                .filter(|(_, re)| re.is_match(content))
                .map(|(finding, _)| *finding)
                .collect(),
        }
    }
}
