//! Message text sanitization and validation.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize, Serializer};

const SPECIAL_CHARACTERS: &[char] = &[
    '<', '>', '\'', '"', '&', ';', '(', ')', '{', '}', '[', ']',
];

/// Elements removed together with everything between their tags.
const STRIPPED_ELEMENTS: [&str; 5] = ["script", "style", "iframe", "object", "embed"];

static ELEMENT_BLOCKS: Lazy<Vec<Regex>> = Lazy::new(|| {
    STRIPPED_ELEMENTS
        .iter()
        .map(|tag| {
            Regex::new(&format!(r"(?is)<{tag}\b[^>]*>.*?</{tag}\s*>"))
                .expect("element pattern is valid")
        })
        .collect()
});

static MARKUP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)<!--.*?-->|<[!/?]?[A-Za-z][^>]*>").expect("markup pattern is valid")
});

static URI_SCHEMES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:javascript|vbscript|data)\s*:").expect("scheme pattern is valid")
});

static EVENT_HANDLERS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bon[a-z]+\s*=").expect("handler pattern is valid"));

static SUSPICIOUS_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    [
        ("script_tag", r"(?i)<script"),
        ("javascript_uri", r"(?i)javascript\s*:"),
        ("event_handler", r"(?i)\bon[a-z]+\s*="),
        ("data_html_uri", r"(?i)data\s*:\s*text/html"),
        ("iframe_tag", r"(?i)<iframe"),
        ("object_tag", r"(?i)<object"),
        ("embed_tag", r"(?i)<embed"),
        ("link_tag", r"(?i)<link"),
        ("meta_tag", r"(?i)<meta"),
    ]
    .into_iter()
    .map(|(name, pattern)| {
        (
            name,
            Regex::new(pattern).expect("suspicious pattern is valid"),
        )
    })
    .collect()
});

/// Thresholds applied to message text. Lengths count characters, not bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentPolicy {
    pub min_length: usize,
    pub max_length: usize,
    /// Sanitized text shorter than this fraction of the input is treated as
    /// an injection attempt.
    pub min_retained_ratio: f64,
    pub max_special_char_ratio: f64,
    pub max_links: usize,
    pub max_repeated_run: usize,
}

impl Default for ContentPolicy {
    fn default() -> Self {
        Self {
            min_length: 1,
            max_length: 1000,
            min_retained_ratio: 0.5,
            max_special_char_ratio: 0.1,
            max_links: 2,
            max_repeated_run: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentError {
    Required,
    TooShort { min: usize },
    TooLong { max: usize },
    FailedSanitization,
    SuspiciousPattern(&'static str),
    ExcessiveSpecialCharacters,
}

impl ContentError {
    pub fn code(&self) -> &'static str {
        match self {
            ContentError::Required => "content_required",
            ContentError::TooShort { .. } => "content_too_short",
            ContentError::TooLong { .. } => "content_too_long",
            ContentError::FailedSanitization => "failed_sanitization",
            ContentError::SuspiciousPattern(_) => "suspicious_pattern",
            ContentError::ExcessiveSpecialCharacters => "excessive_special_characters",
        }
    }

    /// Errors that point at an injection attempt rather than a typo.
    pub fn is_security_related(&self) -> bool {
        matches!(
            self,
            ContentError::FailedSanitization | ContentError::SuspiciousPattern(_)
        )
    }
}

impl fmt::Display for ContentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentError::Required => f.write_str("content required"),
            ContentError::TooShort { min } => {
                write!(f, "content must be at least {min} characters")
            }
            ContentError::TooLong { max } => {
                write!(f, "content must be at most {max} characters")
            }
            ContentError::FailedSanitization => f.write_str("failed security sanitization"),
            ContentError::SuspiciousPattern(name) => {
                write!(f, "content contains a suspicious pattern ({name})")
            }
            ContentError::ExcessiveSpecialCharacters => {
                f.write_str("excessive special characters")
            }
        }
    }
}

impl Serialize for ContentError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContentValidation {
    pub is_valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sanitized_content: Option<String>,
    pub errors: Vec<ContentError>,
}

/// Reduces `raw` to plain text.
///
/// Strips markup, dangerous URI schemes and inline event handlers, then trims.
/// The passes repeat until nothing changes, so the result is stable under a
/// second call.
pub fn sanitize(raw: &str) -> String {
    let mut current = raw.trim().to_owned();
    loop {
        let next = sanitize_pass(&current);
        if next == current {
            return current;
        }
        current = next;
    }
}

fn sanitize_pass(input: &str) -> String {
    let mut text = input.to_owned();
    for block in ELEMENT_BLOCKS.iter() {
        text = block.replace_all(&text, "").into_owned();
    }
    text = MARKUP.replace_all(&text, "").into_owned();
    text = URI_SCHEMES.replace_all(&text, "").into_owned();
    text = EVENT_HANDLERS.replace_all(&text, "").into_owned();
    text.trim().to_owned()
}

/// Names of the suspicious patterns found in `content`, in declaration order.
pub fn suspicious_patterns(content: &str) -> Vec<&'static str> {
    SUSPICIOUS_PATTERNS
        .iter()
        .filter(|(_, pattern)| pattern.is_match(content))
        .map(|(name, _)| *name)
        .collect()
}

pub(crate) fn special_character_count(content: &str) -> usize {
    content
        .chars()
        .filter(|c| SPECIAL_CHARACTERS.contains(c))
        .count()
}

pub(crate) fn exceeds_ratio(count: usize, total: usize, ratio: f64) -> bool {
    total > 0 && count as f64 > total as f64 * ratio
}

/// Validates and sanitizes a message, collecting every failed rule.
pub fn validate_content(raw: &str, policy: &ContentPolicy) -> ContentValidation {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return ContentValidation {
            is_valid: false,
            sanitized_content: None,
            errors: vec![ContentError::Required],
        };
    }

    let mut errors = Vec::new();
    let length = trimmed.chars().count();
    if length < policy.min_length {
        errors.push(ContentError::TooShort {
            min: policy.min_length,
        });
    } else if length > policy.max_length {
        errors.push(ContentError::TooLong {
            max: policy.max_length,
        });
    }

    let sanitized = sanitize(trimmed);
    let retained = sanitized.chars().count();
    if (retained as f64) < length as f64 * policy.min_retained_ratio {
        errors.push(ContentError::FailedSanitization);
    }

    errors.extend(
        suspicious_patterns(trimmed)
            .into_iter()
            .map(ContentError::SuspiciousPattern),
    );

    if exceeds_ratio(
        special_character_count(trimmed),
        length,
        policy.max_special_char_ratio,
    ) {
        errors.push(ContentError::ExcessiveSpecialCharacters);
    }

    let is_valid = errors.is_empty();
    ContentValidation {
        is_valid,
        sanitized_content: is_valid.then_some(sanitized),
        errors,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn validate(raw: &str) -> ContentValidation {
        validate_content(raw, &ContentPolicy::default())
    }

    proptest! {
        #[test]
        fn sanitize_is_idempotent(raw in ".{0,200}") {
            let once = sanitize(&raw);
            prop_assert_eq!(sanitize(&once), once);
        }

        #[test]
        fn sanitize_is_idempotent_on_markup_soup(raw in "[<>/=:a-z \"']{0,120}") {
            let once = sanitize(&raw);
            prop_assert_eq!(sanitize(&once), once);
        }
    }

    #[test]
    fn strips_markup_and_script_bodies() {
        assert_eq!(sanitize("<b>bold</b> move"), "bold move");
        assert_eq!(sanitize("<script>alert(1)</script>hello"), "hello");
        assert_eq!(sanitize("<SCRIPT type=x>\nalert(1)\n</script >hi"), "hi");
        assert_eq!(sanitize("  <!-- note --> dock at 9 "), "dock at 9");
    }

    #[test]
    fn neutralizes_schemes_and_handlers() {
        assert_eq!(sanitize("javascript:alert(1)"), "alert(1)");
        assert_eq!(sanitize("go to DATA :x"), "go to x");
        assert_eq!(sanitize("x onclick=\"y\""), "x \"y\"");
        assert_eq!(sanitize("jajavascript:vascript:run"), "run");
    }

    #[test]
    fn keeps_plain_comparisons() {
        assert_eq!(sanitize("3 < 5 and 7 > 2"), "3 < 5 and 7 > 2");
    }

    #[test]
    fn reassembled_tags_are_removed() {
        assert_eq!(sanitize("<<b>script>"), "");
    }

    #[test]
    fn accepts_plain_message() {
        let result = validate("  Hi there  ");
        assert!(result.is_valid);
        assert_eq!(result.sanitized_content.as_deref(), Some("Hi there"));
        assert!(result.errors.is_empty());
    }

    #[test]
    fn script_injection_is_rejected() {
        let result = validate("<script>alert(1)</script>hello");
        assert!(!result.is_valid);
        assert!(result.sanitized_content.is_none());
        assert!(result.errors.contains(&ContentError::FailedSanitization));
        assert!(result
            .errors
            .contains(&ContentError::SuspiciousPattern("script_tag")));
    }

    #[test]
    fn suspicious_pattern_reported_even_when_sanitized_text_survives() {
        let result = validate("please read the onboarding notes, onload= was a typo");
        assert!(!result.is_valid);
        assert_eq!(
            result.errors,
            vec![ContentError::SuspiciousPattern("event_handler")]
        );
    }

    #[test]
    fn length_boundaries() {
        assert!(validate(&"a".repeat(1000)).is_valid);

        let result = validate(&"a".repeat(1001));
        assert_eq!(result.errors, vec![ContentError::TooLong { max: 1000 }]);
        assert_eq!(
            result.errors[0].to_string(),
            "content must be at most 1000 characters"
        );

        let result = validate("");
        assert_eq!(result.errors, vec![ContentError::Required]);
        assert_eq!(result.errors[0].to_string(), "content required");
        assert_eq!(validate(" \n\t ").errors, vec![ContentError::Required]);
    }

    #[test]
    fn length_counts_characters_not_bytes() {
        assert!(validate(&"ß".repeat(1000)).is_valid);
    }

    #[test]
    fn minimum_length_is_configurable() {
        let policy = ContentPolicy {
            min_length: 5,
            ..ContentPolicy::default()
        };
        let result = validate_content("ahoy", &policy);
        assert_eq!(result.errors, vec![ContentError::TooShort { min: 5 }]);
    }

    #[test]
    fn special_character_density_is_flagged() {
        let result = validate("fn main() { let x = [1]; }");
        assert!(result
            .errors
            .contains(&ContentError::ExcessiveSpecialCharacters));

        let relaxed = ContentPolicy {
            max_special_char_ratio: 0.5,
            ..ContentPolicy::default()
        };
        assert!(validate_content("fn main() { let x = [1]; }", &relaxed).is_valid);
    }

    #[test]
    fn markup_heavy_input_fails_sanitization() {
        let result = validate("<b><i><u>ok</u></i></b>");
        assert!(result.errors.contains(&ContentError::FailedSanitization));
    }
}
