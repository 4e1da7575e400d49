use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// When a bridge-attached thread is detached from the runtime.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetachPolicy {
    /// Keep the attachment until the thread exits.
    #[default]
    Lazy,
    /// Detach as soon as the outermost call on the thread returns.
    Eager,
}

impl fmt::Display for DetachPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lazy => f.write_str("lazy"),
            Self::Eager => f.write_str("eager"),
        }
    }
}

impl FromStr for DetachPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lazy" => Ok(Self::Lazy),
            "eager" => Ok(Self::Eager),
            other => Err(format!("unknown detach policy '{other}' (expected lazy or eager)")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        assert_eq!("lazy".parse::<DetachPolicy>().unwrap(), DetachPolicy::Lazy);
        assert_eq!(" EAGER ".parse::<DetachPolicy>().unwrap(), DetachPolicy::Eager);
        assert!("sometimes".parse::<DetachPolicy>().is_err());
        assert_eq!(DetachPolicy::Eager.to_string(), "eager");
        assert_eq!(DetachPolicy::default(), DetachPolicy::Lazy);
    }

    #[test]
    fn serde_uses_snake_case() {
        assert_eq!(serde_json::to_string(&DetachPolicy::Eager).unwrap(), "\"eager\"");
        let p: DetachPolicy = serde_json::from_str("\"lazy\"").unwrap();
        assert_eq!(p, DetachPolicy::Lazy);
    }
}
