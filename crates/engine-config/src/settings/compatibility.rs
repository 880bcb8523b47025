use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompatibilityOption {
    StripDefiners,
    StripTablespaces,
    ForceInnodb,
    CreateInvisiblePks,
    IgnoreMissingPks,
    StripRestrictedGrants,
    SkipInvalidAccounts,
}

impl CompatibilityOption {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompatibilityOption::StripDefiners => "strip_definers",
            CompatibilityOption::StripTablespaces => "strip_tablespaces",
            CompatibilityOption::ForceInnodb => "force_innodb",
            CompatibilityOption::CreateInvisiblePks => "create_invisible_pks",
            CompatibilityOption::IgnoreMissingPks => "ignore_missing_pks",
            CompatibilityOption::StripRestrictedGrants => "strip_restricted_grants",
            CompatibilityOption::SkipInvalidAccounts => "skip_invalid_accounts",
        }
    }
}

impl fmt::Display for CompatibilityOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// DDL rewrites applied while dumping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompatibilityConfig {
    pub compatibility: Vec<CompatibilityOption>,
}

impl CompatibilityConfig {
    pub fn has(&self, option: CompatibilityOption) -> bool {
        self.compatibility.contains(&option)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.compatibility.iter().map(|o| o.to_string()).collect();
        names.sort();
        names.dedup();
        names
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.has(CompatibilityOption::CreateInvisiblePks)
            && self.has(CompatibilityOption::IgnoreMissingPks)
        {
            return Err(ConfigError::Conflict(
                "create_invisible_pks",
                "ignore_missing_pks",
            ));
        }
        Ok(())
    }
}
