//! Closed string sets for the guardrail state model.
//!
//! Everything here serializes to lowercase strings on the wire and at
//! rest; inbound strings parse through `FromStr` so an invalid database
//! row or request surfaces as an error instead of a silent default.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} value: {value}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! closed_set {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant,)+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant,)+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(UnknownVariant {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

closed_set!(HaltType, "halt_type", {
    CodeSafety => "code_safety",
    Scope => "scope",
    Environment => "environment",
    Execution => "execution",
    Security => "security",
    Uncertainty => "uncertainty",
});

// Ordered low→critical so `max()` picks the most severe reason.
closed_set!(HaltSeverity, "halt_severity", {
    Low => "low",
    Medium => "medium",
    High => "high",
    Critical => "critical",
});

closed_set!(HaltResolution, "resolution", {
    Pending => "pending",
    Resolved => "resolved",
    Escalated => "escalated",
    Dismissed => "dismissed",
    Timeout => "timeout",
});

impl HaltResolution {
    /// Terminal states are immutable.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

closed_set!(AttemptResolution, "resolution", {
    Pending => "pending",
    Resolved => "resolved",
    Escalated => "escalated",
});

closed_set!(FixType, "fix_type", {
    Regex => "regex",
    Code => "code",
    Config => "config",
});

closed_set!(VerificationStatus, "verification_status", {
    Confirmed => "confirmed",
    Modified => "modified",
    Removed => "removed",
});

closed_set!(CodeType, "code_type", {
    Production => "production",
    Test => "test",
});

closed_set!(UncertaintyLevel, "uncertainty_level", {
    Low => "low",
    Medium => "medium",
    High => "high",
    Critical => "critical",
    Blocked => "blocked",
});

impl UncertaintyLevel {
    /// Map the 0-10 self-reported score onto the scale. Scores above 10
    /// clamp to critical.
    pub fn from_score(score: u8) -> Self {
        match score {
            0..=4 => Self::Low,
            5..=6 => Self::Medium,
            7..=8 => Self::High,
            _ => Self::Critical,
        }
    }

    /// Scores of 7 and above suggest halting.
    pub fn suggests_halt(&self) -> bool {
        matches!(self, Self::High | Self::Critical | Self::Blocked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_sets_round_trip() {
        for v in HaltType::ALL {
            assert_eq!(v.as_str().parse::<HaltType>().unwrap(), *v);
        }
        for v in HaltResolution::ALL {
            assert_eq!(v.as_str().parse::<HaltResolution>().unwrap(), *v);
        }
        for v in UncertaintyLevel::ALL {
            assert_eq!(v.as_str().parse::<UncertaintyLevel>().unwrap(), *v);
        }
    }

    #[test]
    fn unknown_values_error() {
        let err = "panic".parse::<HaltType>().unwrap_err();
        assert_eq!(err.kind, "halt_type");
        assert_eq!(err.value, "panic");
    }

    #[test]
    fn serde_uses_lowercase() {
        assert_eq!(
            serde_json::to_string(&HaltType::CodeSafety).unwrap(),
            r#""code_safety""#
        );
        assert_eq!(
            serde_json::to_string(&HaltSeverity::Critical).unwrap(),
            r#""critical""#
        );
    }

    #[test]
    fn halt_severity_orders() {
        assert!(HaltSeverity::Critical > HaltSeverity::High);
        assert!(HaltSeverity::High > HaltSeverity::Medium);
        assert!(HaltSeverity::Medium > HaltSeverity::Low);
    }

    #[test]
    fn only_pending_is_non_terminal() {
        assert!(!HaltResolution::Pending.is_terminal());
        assert!(HaltResolution::Resolved.is_terminal());
        assert!(HaltResolution::Dismissed.is_terminal());
        assert!(HaltResolution::Timeout.is_terminal());
    }

    #[test]
    fn uncertainty_score_mapping() {
        assert_eq!(UncertaintyLevel::from_score(0), UncertaintyLevel::Low);
        assert_eq!(UncertaintyLevel::from_score(4), UncertaintyLevel::Low);
        assert_eq!(UncertaintyLevel::from_score(5), UncertaintyLevel::Medium);
        assert_eq!(UncertaintyLevel::from_score(6), UncertaintyLevel::Medium);
        assert_eq!(UncertaintyLevel::from_score(7), UncertaintyLevel::High);
        assert_eq!(UncertaintyLevel::from_score(8), UncertaintyLevel::High);
        assert_eq!(UncertaintyLevel::from_score(9), UncertaintyLevel::Critical);
        assert_eq!(UncertaintyLevel::from_score(10), UncertaintyLevel::Critical);
        assert_eq!(UncertaintyLevel::from_score(11), UncertaintyLevel::Critical);

        assert!(!UncertaintyLevel::from_score(6).suggests_halt());
        assert!(UncertaintyLevel::from_score(7).suggests_halt());
    }
}
