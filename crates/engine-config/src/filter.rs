use crate::error::ConfigError;
pub use model::core::identifiers::split_qualified;
use model::core::identifiers::ObjectName;
use serde::Deserialize;

/// Include/exclude lists for every object kind. Empty include lists mean
/// "everything". Entries naming objects that do not exist are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FilterConfig {
    pub include_schemas: Vec<String>,
    pub exclude_schemas: Vec<String>,
    /// `schema.table`
    pub include_tables: Vec<String>,
    pub exclude_tables: Vec<String>,
    /// `schema.event`
    pub include_events: Vec<String>,
    pub exclude_events: Vec<String>,
    /// `schema.routine`
    pub include_routines: Vec<String>,
    pub exclude_routines: Vec<String>,
    /// `schema.table` or `schema.table.trigger`
    pub include_triggers: Vec<String>,
    pub exclude_triggers: Vec<String>,
    /// `'user'@'host'` or `user` for every host
    pub include_users: Vec<String>,
    pub exclude_users: Vec<String>,
    pub events: bool,
    pub routines: bool,
    pub triggers: bool,
    pub users: bool,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            include_schemas: Vec::new(),
            exclude_schemas: Vec::new(),
            include_tables: Vec::new(),
            exclude_tables: Vec::new(),
            include_events: Vec::new(),
            exclude_events: Vec::new(),
            include_routines: Vec::new(),
            exclude_routines: Vec::new(),
            include_triggers: Vec::new(),
            exclude_triggers: Vec::new(),
            include_users: Vec::new(),
            exclude_users: Vec::new(),
            events: true,
            routines: true,
            triggers: true,
            users: true,
        }
    }
}

/// A user account pattern. `host = None` matches every host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountPattern {
    pub user: String,
    pub host: Option<String>,
}

impl AccountPattern {
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        if value.is_empty() {
            return None;
        }
        let unquote = |s: &str| -> String {
            let s = s.trim();
            let s = s
                .strip_prefix('\'')
                .and_then(|s| s.strip_suffix('\''))
                .or_else(|| s.strip_prefix('`').and_then(|s| s.strip_suffix('`')))
                .unwrap_or(s);
            s.to_string()
        };
        match value.rfind('@') {
            Some(at) if value[..at].ends_with('\'') || !value[..at].contains('\'') => {
                let user = unquote(&value[..at]);
                let host = unquote(&value[at + 1..]);
                Some(Self {
                    user,
                    host: Some(host),
                })
            }
            _ => Some(Self {
                user: unquote(value),
                host: None,
            }),
        }
    }

    pub fn matches(&self, user: &str, host: &str) -> bool {
        self.user == user && self.host.as_deref().is_none_or(|h| h == host)
    }
}

fn contains_schema(list: &[String], schema: &str) -> bool {
    list.iter().any(|s| s == schema)
}

fn contains_object(list: &[String], schema: &str, name: &str) -> bool {
    list.iter().any(|entry| {
        split_qualified(entry).is_some_and(|parts| parts.len() == 2 && parts[0] == schema && parts[1] == name)
    })
}

impl FilterConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, list, lens) in [
            ("includeTables", &self.include_tables, &[2usize][..]),
            ("excludeTables", &self.exclude_tables, &[2][..]),
            ("includeEvents", &self.include_events, &[2][..]),
            ("excludeEvents", &self.exclude_events, &[2][..]),
            ("includeRoutines", &self.include_routines, &[2][..]),
            ("excludeRoutines", &self.exclude_routines, &[2][..]),
            ("includeTriggers", &self.include_triggers, &[2, 3][..]),
            ("excludeTriggers", &self.exclude_triggers, &[2, 3][..]),
        ] {
            for entry in list {
                match split_qualified(entry) {
                    Some(parts) if lens.contains(&parts.len()) => {}
                    _ => {
                        return Err(ConfigError::invalid(
                            field,
                            format!("'{entry}' is not a valid qualified name"),
                        ));
                    }
                }
            }
        }
        for (field, list) in [
            ("includeUsers", &self.include_users),
            ("excludeUsers", &self.exclude_users),
        ] {
            if let Some(bad) = list.iter().find(|u| AccountPattern::parse(u).is_none()) {
                return Err(ConfigError::invalid(field, format!("'{bad}' is not an account")));
            }
        }
        if let Some(both) = self
            .include_schemas
            .iter()
            .find(|s| self.exclude_schemas.contains(s))
        {
            return Err(ConfigError::invalid(
                "excludeSchemas",
                format!("schema '{both}' is both included and excluded"),
            ));
        }
        Ok(())
    }

    pub fn schema_included(&self, schema: &str) -> bool {
        (self.include_schemas.is_empty() || contains_schema(&self.include_schemas, schema))
            && !contains_schema(&self.exclude_schemas, schema)
    }

    pub fn table_included(&self, table: &ObjectName) -> bool {
        let (schema, name) = (table.schema.as_str(), table.name.as_str());
        self.schema_included(schema)
            && (self.include_tables.is_empty() || contains_object(&self.include_tables, schema, name))
            && !contains_object(&self.exclude_tables, schema, name)
    }

    pub fn event_included(&self, schema: &str, name: &str) -> bool {
        self.events
            && (self.include_events.is_empty() || contains_object(&self.include_events, schema, name))
            && !contains_object(&self.exclude_events, schema, name)
    }

    pub fn routine_included(&self, schema: &str, name: &str) -> bool {
        self.routines
            && (self.include_routines.is_empty()
                || contains_object(&self.include_routines, schema, name))
            && !contains_object(&self.exclude_routines, schema, name)
    }

    pub fn trigger_included(&self, schema: &str, table: &str, name: &str) -> bool {
        let matches = |list: &[String]| {
            list.iter().any(|entry| match split_qualified(entry).as_deref() {
                Some([s, t]) => s == schema && t == table,
                Some([s, t, n]) => s == schema && t == table && n == name,
                _ => false,
            })
        };
        self.triggers
            && (self.include_triggers.is_empty() || matches(&self.include_triggers))
            && !matches(&self.exclude_triggers)
    }

    pub fn user_included(&self, user: &str, host: &str) -> bool {
        let matches = |list: &[String]| {
            list.iter()
                .filter_map(|u| AccountPattern::parse(u))
                .any(|p| p.matches(user, host))
        };
        self.users
            && (self.include_users.is_empty() || matches(&self.include_users))
            && !matches(&self.exclude_users)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_quoted_names() {
        assert_eq!(
            split_qualified("`my.db`.`t``1`").unwrap(),
            vec!["my.db".to_string(), "t`1".to_string()]
        );
        assert!(split_qualified("db.").is_none());
        assert!(split_qualified("`db.t").is_none());
    }

    #[test]
    fn table_filters() {
        let filter = FilterConfig {
            exclude_schemas: vec!["tmp".into()],
            exclude_tables: vec!["app.audit".into()],
            ..Default::default()
        };
        assert!(filter.table_included(&ObjectName::new("app", "users")));
        assert!(!filter.table_included(&ObjectName::new("app", "audit")));
        assert!(!filter.table_included(&ObjectName::new("tmp", "x")));

        let only = FilterConfig {
            include_tables: vec!["app.users".into()],
            ..Default::default()
        };
        assert!(only.table_included(&ObjectName::new("app", "users")));
        assert!(!only.table_included(&ObjectName::new("app", "orders")));
    }

    #[test]
    fn trigger_and_user_filters() {
        let filter = FilterConfig {
            exclude_triggers: vec!["app.orders.trg_audit".into()],
            exclude_users: vec!["'root'@'localhost'".into(), "replicator".into()],
            ..Default::default()
        };
        assert!(!filter.trigger_included("app", "orders", "trg_audit"));
        assert!(filter.trigger_included("app", "orders", "trg_other"));
        assert!(!filter.user_included("root", "localhost"));
        assert!(filter.user_included("root", "%"));
        assert!(!filter.user_included("replicator", "10.0.0.1"));

        let no_triggers = FilterConfig {
            triggers: false,
            ..Default::default()
        };
        assert!(!no_triggers.trigger_included("a", "b", "c"));
    }

    #[test]
    fn validation() {
        let bad = FilterConfig {
            include_tables: vec!["nodot".into()],
            ..Default::default()
        };
        assert!(bad.validate().is_err());

        let both = FilterConfig {
            include_schemas: vec!["a".into()],
            exclude_schemas: vec!["a".into()],
            ..Default::default()
        };
        assert!(both.validate().is_err());
        FilterConfig::default().validate().unwrap();
    }

    #[test]
    fn parses_accounts() {
        assert_eq!(
            AccountPattern::parse("'app'@'%'").unwrap(),
            AccountPattern {
                user: "app".into(),
                host: Some("%".into())
            }
        );
        assert_eq!(AccountPattern::parse("app").unwrap().host, None);
        assert!(AccountPattern::parse(" ").is_none());
    }
}
