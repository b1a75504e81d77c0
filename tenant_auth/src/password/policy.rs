//! Password policy and scoring engine.

use serde::{Deserialize, Serialize};

use super::patterns::{self, WeakPattern};
use crate::errors::{AuthError, AuthResult};

/// Configurable password rules
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PasswordPolicy {
    pub min_length: usize,
    pub max_length: usize,
    pub require_uppercase: bool,
    pub require_lowercase: bool,
    pub require_digit: bool,
    pub require_special: bool,
    /// Longest allowed run of one repeated character
    pub max_consecutive: usize,
    /// Highest share of the password a single character may take
    pub max_char_share: f64,
    /// Case-insensitive substrings that reject a password outright
    pub forbidden_words: Vec<String>,
    /// Minimum total score (0-100)
    pub complexity_threshold: u32,
}

impl Default for PasswordPolicy {
    fn default() -> Self {
        Self {
            min_length: 12,
            max_length: 128,
            require_uppercase: true,
            require_lowercase: true,
            require_digit: true,
            require_special: true,
            max_consecutive: 3,
            max_char_share: 0.4,
            forbidden_words: [
                "password", "passwd", "admin", "qwerty", "letmein", "welcome", "iloveyou",
                "monkey", "dragon", "123456",
            ]
            .iter()
            .map(|w| w.to_string())
            .collect(),
            complexity_threshold: 60,
        }
    }
}

/// Strength band derived from the total score
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PasswordStrength {
    VeryWeak,
    Weak,
    Medium,
    Strong,
    VeryStrong,
}

impl PasswordStrength {
    pub fn from_score(score: u32) -> Self {
        match score {
            0..=39 => PasswordStrength::VeryWeak,
            40..=59 => PasswordStrength::Weak,
            60..=79 => PasswordStrength::Medium,
            80..=89 => PasswordStrength::Strong,
            _ => PasswordStrength::VeryStrong,
        }
    }
}

/// Result of evaluating a candidate password
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PasswordValidation {
    pub is_valid: bool,
    /// Total score, 0-100
    pub score: u32,
    pub strength: PasswordStrength,
    /// Hard-reject reasons
    pub errors: Vec<String>,
    pub suggestions: Vec<String>,
}

/// Scores and accepts or rejects candidate passwords
#[derive(Debug, Clone, Default)]
pub struct PasswordPolicyEngine {
    policy: PasswordPolicy,
}

const LENGTH_BASE: u32 = 15;
const LENGTH_CAP: u32 = 30;
const PATTERN_BASE: u32 = 15;
const PATTERN_PENALTY: u32 = 3;

impl PasswordPolicyEngine {
    pub fn new(policy: PasswordPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &PasswordPolicy {
        &self.policy
    }

    /// Evaluate a password
    ///
    /// # Arguments
    ///
    /// * `password` - Candidate password
    /// * `username` - Account name; rejected if contained in the password (ignored when shorter than 3)
    /// * `email` - Account email; its local part is treated like `username`
    ///
    /// # Returns
    ///
    /// * `PasswordValidation` - Valid only with zero hard-reject errors and a score at or above the threshold
    pub fn validate(&self, password: &str, username: &str, email: &str) -> PasswordValidation {
        let mut errors = Vec::new();
        let mut suggestions = Vec::new();
        let length = password.chars().count();
        let lowered = password.to_lowercase();

        if length < self.policy.min_length {
            errors.push(format!(
                "Password must be at least {} characters",
                self.policy.min_length
            ));
        }
        if length > self.policy.max_length {
            errors.push(format!(
                "Password must be at most {} characters",
                self.policy.max_length
            ));
        }

        let has_lower = password.chars().any(|c| c.is_lowercase());
        let has_upper = password.chars().any(|c| c.is_uppercase());
        let has_digit = password.chars().any(|c| c.is_ascii_digit());
        let has_special = password.chars().any(is_special);

        if self.policy.require_lowercase && !has_lower {
            errors.push("Password must contain a lowercase letter".to_string());
        }
        if self.policy.require_uppercase && !has_upper {
            errors.push("Password must contain an uppercase letter".to_string());
        }
        if self.policy.require_digit && !has_digit {
            errors.push("Password must contain a digit".to_string());
        }
        if self.policy.require_special && !has_special {
            errors.push("Password must contain a special character".to_string());
        }

        if let Some(word) = self
            .policy
            .forbidden_words
            .iter()
            .find(|w| !w.is_empty() && lowered.contains(&w.to_lowercase()))
        {
            errors.push(format!("Password contains a forbidden word: {word}"));
        }

        let username = username.trim().to_lowercase();
        if username.chars().count() >= 3 && lowered.contains(&username) {
            errors.push("Password must not contain the username".to_string());
        }
        let local_part = email
            .split('@')
            .next()
            .unwrap_or_default()
            .trim()
            .to_lowercase();
        if local_part.chars().count() >= 3 && lowered.contains(&local_part) {
            errors.push("Password must not contain the email address".to_string());
        }

        if patterns::longest_run(password) > self.policy.max_consecutive {
            errors.push(format!(
                "Password must not repeat a character more than {} times in a row",
                self.policy.max_consecutive
            ));
        }
        if length > 0 && patterns::max_char_share(password) > self.policy.max_char_share {
            errors.push("Password repeats the same character too often".to_string());
        }

        // Sub-scores
        let length_score = if length >= self.policy.min_length {
            (LENGTH_BASE + (length - self.policy.min_length) as u32).min(LENGTH_CAP)
        } else {
            0
        };

        let mut variety_score = 0;
        if has_lower {
            variety_score += 5;
        }
        if has_upper {
            variety_score += 5;
        }
        if has_digit {
            variety_score += 10;
        }
        if has_special {
            variety_score += 15;
        }

        let uniqueness_score = if length == 0 {
            0
        } else {
            let unique = password
                .chars()
                .collect::<std::collections::HashSet<_>>()
                .len();
            ((unique as f64 / length as f64) * 20.0).round() as u32
        };

        let weak = patterns::find_weak_patterns(password);
        let pattern_score =
            PATTERN_BASE.saturating_sub(PATTERN_PENALTY.saturating_mul(weak.len() as u32));

        let score = (length_score + variety_score + uniqueness_score + pattern_score).min(100);

        if length < self.policy.min_length + 4 {
            suggestions.push("Use a longer password".to_string());
        }
        if !has_special {
            suggestions.push("Add special characters such as !@#$%".to_string());
        }
        if !(has_lower && has_upper) {
            suggestions.push("Mix uppercase and lowercase letters".to_string());
        }
        if weak.contains(&WeakPattern::Sequence) {
            suggestions.push("Avoid sequences like 'abc' or '123'".to_string());
        }
        if weak.contains(&WeakPattern::KeyboardRun) {
            suggestions.push("Avoid keyboard patterns like 'qwe' or 'asd'".to_string());
        }
        if weak.contains(&WeakPattern::Repeat) {
            suggestions.push("Avoid repeating the same character".to_string());
        }

        PasswordValidation {
            is_valid: errors.is_empty() && score >= self.policy.complexity_threshold,
            score,
            strength: PasswordStrength::from_score(score),
            errors,
            suggestions,
        }
    }

    /// Validate and convert a rejection into [`AuthError::WeakPassword`]
    pub fn enforce(&self, password: &str, username: &str, email: &str) -> AuthResult<PasswordValidation> {
        let validation = self.validate(password, username, email);
        if validation.is_valid {
            return Ok(validation);
        }

        let mut reasons = validation.errors.clone();
        if validation.score < self.policy.complexity_threshold {
            reasons.push(format!(
                "Password is too weak (score {}/100, need {})",
                validation.score, self.policy.complexity_threshold
            ));
        }
        Err(AuthError::WeakPassword(reasons))
    }
}

fn is_special(c: char) -> bool {
    !c.is_alphanumeric() && !c.is_whitespace()
}
