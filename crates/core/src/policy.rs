use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    audit::DEFAULT_AUDIT_CAPACITY, content::ContentPolicy, rate_limit::RateLimitPolicy,
};

#[derive(Debug, Error, PartialEq)]
pub enum PolicyError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("{name} must be between 0 and 1 (got {value})")]
    RatioOutOfRange { name: &'static str, value: f64 },
    #[error("min_length ({min}) exceeds max_length ({max})")]
    LengthBounds { min: usize, max: usize },
}

/// Every tunable threshold of the message security pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityPolicy {
    pub content: ContentPolicy,
    pub rate_limit: RateLimitPolicy,
    pub audit_capacity: usize,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            content: ContentPolicy::default(),
            rate_limit: RateLimitPolicy::default(),
            audit_capacity: DEFAULT_AUDIT_CAPACITY,
        }
    }
}

impl SecurityPolicy {
    pub fn validate(&self) -> Result<(), PolicyError> {
        let content = &self.content;
        if content.max_length == 0 {
            return Err(PolicyError::Zero("content.max_length"));
        }
        if content.min_length > content.max_length {
            return Err(PolicyError::LengthBounds {
                min: content.min_length,
                max: content.max_length,
            });
        }
        for (name, value) in [
            ("content.min_retained_ratio", content.min_retained_ratio),
            ("content.max_special_char_ratio", content.max_special_char_ratio),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(PolicyError::RatioOutOfRange { name, value });
            }
        }

        let limits = [
            ("rate_limit.burst", self.rate_limit.burst),
            ("rate_limit.sustained", self.rate_limit.sustained),
        ];
        for (name, limit) in limits {
            if limit.max_attempts == 0 || limit.window_secs == 0 {
                return Err(PolicyError::Zero(name));
            }
        }

        if self.audit_capacity == 0 {
            return Err(PolicyError::Zero("audit_capacity"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::WindowLimit;

    #[test]
    fn defaults_are_valid() {
        let policy = SecurityPolicy::default();
        assert_eq!(policy.validate(), Ok(()));
        assert_eq!(policy.content.max_length, 1000);
        assert_eq!(policy.rate_limit.burst.max_attempts, 3);
        assert_eq!(policy.rate_limit.sustained.window_secs, 60);
        assert_eq!(policy.audit_capacity, 100);
    }

    #[test]
    fn rejects_inverted_length_bounds() {
        let mut policy = SecurityPolicy::default();
        policy.content.min_length = 2000;
        assert_eq!(
            policy.validate(),
            Err(PolicyError::LengthBounds { min: 2000, max: 1000 })
        );
    }

    #[test]
    fn rejects_ratio_above_one() {
        let mut policy = SecurityPolicy::default();
        policy.content.max_special_char_ratio = 1.5;
        assert!(matches!(
            policy.validate(),
            Err(PolicyError::RatioOutOfRange { name: "content.max_special_char_ratio", .. })
        ));
    }

    #[test]
    fn rejects_zero_windows() {
        let mut policy = SecurityPolicy::default();
        policy.rate_limit.burst = WindowLimit {
            max_attempts: 3,
            window_secs: 0,
        };
        assert_eq!(policy.validate(), Err(PolicyError::Zero("rate_limit.burst")));
    }

    #[test]
    fn partial_documents_fill_defaults() {
        let policy: SecurityPolicy =
            serde_json::from_value(serde_json::json!({ "content": { "max_length": 280 } }))
                .unwrap();
        assert_eq!(policy.content.max_length, 280);
        assert_eq!(policy.content.min_retained_ratio, 0.5);
        assert_eq!(policy.rate_limit, RateLimitPolicy::default());
    }
}
