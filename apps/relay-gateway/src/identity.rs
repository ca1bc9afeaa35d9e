use rand::Rng;
use std::fmt;
use thiserror::Error;

pub const DEFAULT_PREFIX: &str = "MA";

const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const GROUP_LEN: usize = 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("remote id prefix must be non-empty uppercase alphanumeric, got '{0}'")]
    InvalidPrefix(String),
    #[error("remote id '{0}' does not match PREFIX-XXXX-XXXX")]
    InvalidFormat(String),
}

/// Stable identifier the gateway registers under. Immutable once built.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct GatewayIdentity(String);

impl GatewayIdentity {
    pub fn generate(prefix: &str) -> Result<Self, IdentityError> {
        let prefix = prefix.trim().to_ascii_uppercase();
        if !is_group(&prefix, None) {
            return Err(IdentityError::InvalidPrefix(prefix));
        }
        let mut rng = rand::thread_rng();
        let mut group = || {
            (0..GROUP_LEN)
                .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
                .collect::<String>()
        };
        let first = group();
        let second = group();
        Ok(Self(format!("{prefix}-{first}-{second}")))
    }

    /// Accepts an externally supplied id. The signaling server upper-cases
    /// ids on registration, so we do the same before validating.
    pub fn parse(raw: &str) -> Result<Self, IdentityError> {
        let normalized = raw.trim().to_ascii_uppercase();
        let mut parts = normalized.split('-');
        let valid = matches!(
            (parts.next(), parts.next(), parts.next(), parts.next()),
            (Some(prefix), Some(first), Some(second), None)
                if is_group(prefix, None)
                    && is_group(first, Some(GROUP_LEN))
                    && is_group(second, Some(GROUP_LEN))
        );
        if valid {
            Ok(Self(normalized))
        } else {
            Err(IdentityError::InvalidFormat(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn matches(&self, other: &str) -> bool {
        self.0.eq_ignore_ascii_case(other.trim())
    }
}

impl fmt::Display for GatewayIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn is_group(value: &str, len: Option<usize>) -> bool {
    !value.is_empty()
        && len.is_none_or(|expected| value.len() == expected)
        && value
            .bytes()
            .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit())
}
