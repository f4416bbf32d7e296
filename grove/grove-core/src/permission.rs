use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Permission granted by a membership. Totally ordered: `Read < Write < Admin`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionLevel {
    Read,
    Write,
    Admin,
}

impl PermissionLevel {
    pub const ALL: [PermissionLevel; 3] = [
        PermissionLevel::Read,
        PermissionLevel::Write,
        PermissionLevel::Admin,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionLevel::Read => "read",
            PermissionLevel::Write => "write",
            PermissionLevel::Admin => "admin",
        }
    }

    /// Whether holding `self` is enough for an operation requiring `required`.
    pub fn allows(self, required: PermissionLevel) -> bool {
        self >= required
    }
}

impl fmt::Display for PermissionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PermissionLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "read" => Ok(PermissionLevel::Read),
            "write" => Ok(PermissionLevel::Write),
            "admin" => Ok(PermissionLevel::Admin),
            other => Err(Error::InvalidPermissionLevel(format!(
                "unknown permission '{}'",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Ordering;

    #[test]
    fn test_total_order() {
        for a in PermissionLevel::ALL {
            for b in PermissionLevel::ALL {
                let holds = [a < b, a == b, a > b];
                assert_eq!(holds.iter().filter(|h| **h).count(), 1, "{a} vs {b}");
                assert_eq!(a >= b, a == b || a > b);
                assert_eq!(a <= b, a == b || a < b);
            }
        }
        assert_eq!(
            PermissionLevel::Read.cmp(&PermissionLevel::Admin),
            Ordering::Less
        );
    }

    #[test]
    fn test_allows_weaker_requirements() {
        assert!(PermissionLevel::Admin.allows(PermissionLevel::Read));
        assert!(PermissionLevel::Write.allows(PermissionLevel::Write));
        assert!(!PermissionLevel::Read.allows(PermissionLevel::Write));
    }

    #[test]
    fn test_parses_and_prints() {
        for level in PermissionLevel::ALL {
            assert_eq!(level.as_str().parse::<PermissionLevel>().unwrap(), level);
        }
        assert_eq!("ADMIN".parse::<PermissionLevel>().unwrap(), PermissionLevel::Admin);
        assert!(matches!(
            "owner".parse::<PermissionLevel>(),
            Err(Error::InvalidPermissionLevel(_))
        ));
        assert_eq!(
            serde_json::to_string(&PermissionLevel::Write).unwrap(),
            "\"write\""
        );
    }
}
