use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::content::{self, ContentPolicy};

static LINKS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(?:https?://|www\.)\S+").expect("link pattern is valid"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }
}

/// Informational assessment attached to the audit trail. It never rejects a
/// message on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecurityAnalysis {
    pub risk_level: RiskLevel,
    pub issues: Vec<String>,
    pub recommendations: Vec<String>,
}

impl SecurityAnalysis {
    fn raise(&mut self, level: RiskLevel) {
        self.risk_level = self.risk_level.max(level);
    }
}

pub fn analyze_security(content: &str, policy: &ContentPolicy) -> SecurityAnalysis {
    let mut analysis = SecurityAnalysis {
        risk_level: RiskLevel::Low,
        issues: Vec::new(),
        recommendations: Vec::new(),
    };

    let patterns = content::suspicious_patterns(content);
    if !patterns.is_empty() {
        analysis.raise(RiskLevel::High);
        analysis.issues.push(format!(
            "potential XSS patterns detected: {}",
            patterns.join(", ")
        ));
        analysis
            .recommendations
            .push("remove markup and script content from the message".to_string());
    }

    let links = LINKS.find_iter(content).count();
    if links > policy.max_links {
        analysis.raise(RiskLevel::Medium);
        analysis
            .issues
            .push(format!("message contains {links} links"));
        analysis
            .recommendations
            .push("verify links before sharing them with the other party".to_string());
    }

    let length = content.chars().count();
    if content::exceeds_ratio(
        content::special_character_count(content),
        length,
        policy.max_special_char_ratio,
    ) {
        analysis.raise(RiskLevel::Medium);
        analysis
            .issues
            .push("high density of special characters".to_string());
        analysis
            .recommendations
            .push("prefer plain prose over code or symbols".to_string());
    }

    let run = longest_repeated_run(content);
    if run > policy.max_repeated_run {
        analysis.raise(RiskLevel::Medium);
        analysis
            .issues
            .push(format!("a single character repeats {run} times in a row"));
        analysis
            .recommendations
            .push("avoid repeated characters that look like spam".to_string());
    }

    analysis
}

fn longest_repeated_run(content: &str) -> usize {
    let mut longest = 0;
    let mut current = 0;
    let mut previous = None;
    for ch in content.chars() {
        if Some(ch) == previous {
            current += 1;
        } else {
            current = 1;
            previous = Some(ch);
        }
        longest = longest.max(current);
    }
    longest
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analyze(content: &str) -> SecurityAnalysis {
        analyze_security(content, &ContentPolicy::default())
    }

    #[test]
    fn plain_text_is_low_risk() {
        let analysis = analyze("See you at the marina at 9am");
        assert_eq!(analysis.risk_level, RiskLevel::Low);
        assert!(analysis.issues.is_empty());
        assert!(analysis.recommendations.is_empty());
    }

    #[test]
    fn xss_forces_high() {
        let analysis = analyze("<iframe src=x></iframe>");
        assert_eq!(analysis.risk_level, RiskLevel::High);
        assert!(analysis.issues[0].contains("iframe_tag"));
    }

    #[test]
    fn many_links_raise_to_medium() {
        let analysis =
            analyze("maps: https://a.example www.b.example http://c.example for the pier");
        assert_eq!(analysis.risk_level, RiskLevel::Medium);
        assert_eq!(analysis.issues, vec!["message contains 3 links".to_string()]);

        let two = analyze("https://a.example and https://b.example");
        assert_eq!(two.risk_level, RiskLevel::Low);
    }

    #[test]
    fn repeated_characters_raise_to_medium() {
        let spam = format!("wow{}", "!".repeat(11));
        assert_eq!(analyze(&spam).risk_level, RiskLevel::Medium);

        let excited = format!("wow{}", "!".repeat(10));
        assert_eq!(analyze(&excited).risk_level, RiskLevel::Low);
    }

    #[test]
    fn dense_symbols_raise_to_medium() {
        let analysis = analyze("a(b)c{d}");
        assert_eq!(analysis.risk_level, RiskLevel::Medium);
        assert_eq!(
            analysis.issues,
            vec!["high density of special characters".to_string()]
        );
        assert_eq!(
            analysis.recommendations,
            vec!["prefer plain prose over code or symbols".to_string()]
        );

        // One bracket pair in a long sentence stays under the ratio.
        let sparse = analyze("Meet at pier four (north side) around nine tomorrow");
        assert_eq!(sparse.risk_level, RiskLevel::Low);
    }

    #[test]
    fn medium_signals_do_not_lower_high() {
        let analysis = analyze("<script>aaaaaaaaaaaaaaaa</script>");
        assert_eq!(analysis.risk_level, RiskLevel::High);
        assert!(analysis.issues.len() >= 2);
    }

    #[test]
    fn longest_run_counts_characters() {
        assert_eq!(longest_repeated_run(""), 0);
        assert_eq!(longest_repeated_run("abc"), 1);
        assert_eq!(longest_repeated_run("aabbbba"), 4);
    }
}
