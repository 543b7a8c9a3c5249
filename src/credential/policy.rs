//! Strength rules applied to new secrets.
//!
//! Rules run in a fixed order and every failing rule is reported, so the
//! caller can show all feedback at once.

use std::collections::{HashMap, HashSet};

use crate::error::FieldViolation;

pub const SPECIAL_CHARACTERS: &str = "!@#$%^&*()_+-=[]{}|;:,.<>?~`";

const COMMON_SECRETS: &[&str] = &[
    "password",
    "password123",
    "admin",
    "administrator",
    "root",
    "toor",
    "pass",
    "test",
    "guest",
    "user",
    "login",
    "welcome",
    "changeme",
    "secret",
    "qwerty",
    "letmein",
    "trustno1",
    "123456789",
    "passw0rd",
];

const KEYBOARD_PATTERNS: &[&str] = &["qwerty", "asdf", "zxcv", "1234", "abcd", "!@#$"];

const SEQUENCES: &[&str] = &["abcdefg", "1234567", "7654321", "gfedcba"];

const MAX_SINGLE_CHAR_SHARE: f64 = 0.25;
const MIN_UNIQUE_RATIO: f64 = 0.4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyViolation {
    TooShort { min: usize },
    TooLong { max: usize },
    MissingUppercase,
    MissingLowercase,
    MissingDigit,
    MissingSpecial,
    CommonSecret,
    KeyboardPattern,
    RepeatedCharacters,
    SequentialCharacters,
    LowDiversity,
}

impl PolicyViolation {
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::TooShort { .. } => "too_short",
            Self::TooLong { .. } => "too_long",
            Self::MissingUppercase => "missing_uppercase",
            Self::MissingLowercase => "missing_lowercase",
            Self::MissingDigit => "missing_digit",
            Self::MissingSpecial => "missing_special",
            Self::CommonSecret => "common_password",
            Self::KeyboardPattern => "keyboard_pattern",
            Self::RepeatedCharacters => "repeated_characters",
            Self::SequentialCharacters => "sequential_characters",
            Self::LowDiversity => "low_diversity",
        }
    }

    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::TooShort { min } => format!("Password must be at least {min} characters long"),
            Self::TooLong { max } => format!("Password must not exceed {max} characters"),
            Self::MissingUppercase => "Password must contain at least one uppercase letter".to_string(),
            Self::MissingLowercase => "Password must contain at least one lowercase letter".to_string(),
            Self::MissingDigit => "Password must contain at least one digit".to_string(),
            Self::MissingSpecial => "Password must contain at least one special character".to_string(),
            Self::CommonSecret => "Password is too common. Please choose a more unique password".to_string(),
            Self::KeyboardPattern => "Password must not contain keyboard patterns".to_string(),
            Self::RepeatedCharacters => "Password has too many repeated characters".to_string(),
            Self::SequentialCharacters => "Password must not contain sequential characters".to_string(),
            Self::LowDiversity => "Password needs more character diversity".to_string(),
        }
    }

    #[must_use]
    pub fn to_field(&self, field: &'static str) -> FieldViolation {
        FieldViolation {
            field,
            code: self.code(),
            message: self.message(),
        }
    }
}

/// Outcome of evaluating a secret; violations are in rule order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyReport {
    pub violations: Vec<PolicyViolation>,
}

impl PolicyReport {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }

    #[must_use]
    pub fn field_violations(&self, field: &'static str) -> Vec<FieldViolation> {
        self.violations.iter().map(|v| v.to_field(field)).collect()
    }
}

#[derive(Debug, Clone)]
pub struct CredentialPolicy {
    min_length: usize,
    max_length: usize,
    require_uppercase: bool,
    require_lowercase: bool,
    require_digit: bool,
    require_special: bool,
    pattern_checks: bool,
}

impl CredentialPolicy {
    /// Enterprise policy: 12 to 128 characters, all four character classes,
    /// deny-list and pattern checks.
    #[must_use]
    pub fn new() -> Self {
        Self {
            min_length: 12,
            max_length: 128,
            require_uppercase: true,
            require_lowercase: true,
            require_digit: true,
            require_special: true,
            pattern_checks: true,
        }
    }

    #[must_use]
    pub fn with_length(mut self, min_length: usize, max_length: usize) -> Self {
        self.min_length = min_length;
        self.max_length = max_length.max(min_length);
        self
    }

    #[must_use]
    pub fn with_special_required(mut self, required: bool) -> Self {
        self.require_special = required;
        self
    }

    #[must_use]
    pub fn with_pattern_checks(mut self, enabled: bool) -> Self {
        self.pattern_checks = enabled;
        self
    }

    #[must_use]
    pub fn min_length(&self) -> usize {
        self.min_length
    }

    #[must_use]
    pub fn evaluate(&self, secret: &str) -> PolicyReport {
        let mut violations = Vec::new();
        let length = secret.chars().count();

        if length < self.min_length {
            violations.push(PolicyViolation::TooShort {
                min: self.min_length,
            });
        }
        if length > self.max_length {
            violations.push(PolicyViolation::TooLong {
                max: self.max_length,
            });
        }
        if self.require_uppercase && !secret.chars().any(char::is_uppercase) {
            violations.push(PolicyViolation::MissingUppercase);
        }
        if self.require_lowercase && !secret.chars().any(char::is_lowercase) {
            violations.push(PolicyViolation::MissingLowercase);
        }
        if self.require_digit && !secret.chars().any(|c| c.is_ascii_digit()) {
            violations.push(PolicyViolation::MissingDigit);
        }
        if self.require_special && !secret.chars().any(|c| SPECIAL_CHARACTERS.contains(c)) {
            violations.push(PolicyViolation::MissingSpecial);
        }

        let lowered = secret.to_lowercase();
        if COMMON_SECRETS.contains(&lowered.as_str()) {
            violations.push(PolicyViolation::CommonSecret);
        }

        if self.pattern_checks && length > 0 {
            if contains_keyboard_pattern(&lowered) {
                violations.push(PolicyViolation::KeyboardPattern);
            }
            if has_dominant_character(&lowered, length) {
                violations.push(PolicyViolation::RepeatedCharacters);
            }
            if SEQUENCES.iter().any(|seq| lowered.contains(seq)) {
                violations.push(PolicyViolation::SequentialCharacters);
            }
            if length >= self.min_length && unique_ratio(&lowered, length) < MIN_UNIQUE_RATIO {
                violations.push(PolicyViolation::LowDiversity);
            }
        }

        PolicyReport { violations }
    }
}

impl Default for CredentialPolicy {
    fn default() -> Self {
        Self::new()
    }
}

fn contains_keyboard_pattern(lowered: &str) -> bool {
    KEYBOARD_PATTERNS.iter().any(|pattern| {
        let reversed: String = pattern.chars().rev().collect();
        lowered.contains(pattern) || lowered.contains(&reversed)
    })
}

#[allow(clippy::cast_precision_loss)]
fn has_dominant_character(lowered: &str, length: usize) -> bool {
    let mut counts: HashMap<char, usize> = HashMap::new();
    for c in lowered.chars() {
        *counts.entry(c).or_default() += 1;
    }
    let max = counts.values().copied().max().unwrap_or(0);
    max as f64 > length as f64 * MAX_SINGLE_CHAR_SHARE
}

#[allow(clippy::cast_precision_loss)]
fn unique_ratio(lowered: &str, length: usize) -> f64 {
    let unique: HashSet<char> = lowered.chars().collect();
    unique.len() as f64 / length as f64
}
