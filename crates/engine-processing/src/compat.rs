//! DDL rewrites that make a dump loadable on servers with stricter rules
//! than the source.

use engine_config::settings::{CompatibilityConfig, CompatibilityOption};
use lazy_static::lazy_static;
use model::dump::task::ObjectKind;
use regex::Regex;

/// Name of the column added to tables without a primary key.
pub const INVISIBLE_PK_COLUMN: &str = "my_row_id";

/// Privileges a managed server does not hand out to regular accounts.
const RESTRICTED_PRIVILEGES: [&str; 12] = [
    "SUPER",
    "FILE",
    "RELOAD",
    "SHUTDOWN",
    "BINLOG_ADMIN",
    "CREATE TABLESPACE",
    "SET_USER_ID",
    "SYSTEM_USER",
    "SYSTEM_VARIABLES_ADMIN",
    "ENCRYPTION_KEY_ADMIN",
    "CONNECTION_ADMIN",
    "GROUP_REPLICATION_ADMIN",
];

/// Authentication plugins that cannot be recreated elsewhere.
const EXTERNAL_AUTH_PLUGINS: [&str; 5] = [
    "auth_socket",
    "authentication_ldap_sasl",
    "authentication_ldap_simple",
    "authentication_pam",
    "authentication_windows",
];

lazy_static! {
    static ref DEFINER_RE: Regex =
        Regex::new(r"(?i)\s+DEFINER\s*=\s*(?:`(?:[^`]|``)*`|'(?:[^']|'')*'|[\w.]+)@(?:`(?:[^`]|``)*`|'(?:[^']|'')*'|[\w%.\-]+)")
            .expect("definer pattern");
    static ref SQL_SECURITY_RE: Regex = Regex::new(r"(?i)SQL\s+SECURITY\s+DEFINER").expect("security pattern");
    static ref TABLESPACE_RE: Regex = Regex::new(
        r"(?i)\s*/\*!\d+\s+TABLESPACE\s+`(?:[^`]|``)*`(?:\s+STORAGE\s+\w+)?\s*\*/|\s+TABLESPACE\s*=?\s*`(?:[^`]|``)*`"
    )
    .expect("tablespace pattern");
    static ref ENGINE_RE: Regex = Regex::new(r"(?i)\bENGINE\s*=\s*(\w+)").expect("engine pattern");
    static ref GRANT_RE: Regex = Regex::new(r"(?is)^\s*GRANT\s+(.+?)\s+ON\s+(.+)$").expect("grant pattern");
    static ref AUTH_PLUGIN_RE: Regex =
        Regex::new(r"(?i)IDENTIFIED\s+WITH\s+'([^']+)'(\s+AS\s+')?").expect("auth pattern");
}

/// Applies the selected compatibility options to captured definitions.
#[derive(Debug, Clone, Default)]
pub struct Compatibility {
    config: CompatibilityConfig,
}

impl Compatibility {
    pub fn new(config: CompatibilityConfig) -> Self {
        Self { config }
    }

    fn has(&self, option: CompatibilityOption) -> bool {
        self.config.has(option)
    }

    pub fn rewrite(&self, kind: ObjectKind, ddl: &str) -> String {
        let mut ddl = ddl.to_string();
        if self.has(CompatibilityOption::StripDefiners)
            && matches!(
                kind,
                ObjectKind::View
                    | ObjectKind::Procedure
                    | ObjectKind::Function
                    | ObjectKind::Event
                    | ObjectKind::Trigger
            )
        {
            ddl = strip_definer(&ddl);
        }
        if kind == ObjectKind::Table {
            if self.has(CompatibilityOption::StripTablespaces) {
                ddl = TABLESPACE_RE.replace_all(&ddl, "").into_owned();
            }
            if self.has(CompatibilityOption::ForceInnodb) {
                ddl = force_innodb(&ddl);
            }
        }
        ddl
    }

    /// Adds an invisible auto-increment primary key when asked to, otherwise
    /// leaves the definition alone.
    pub fn fix_missing_primary_key(&self, ddl: &str) -> Option<String> {
        if !self.has(CompatibilityOption::CreateInvisiblePks) {
            return None;
        }
        let open = ddl.find(" (\n").map(|i| i + 1).or_else(|| ddl.find('('))?;
        let (head, tail) = ddl.split_at(open + 1);
        Some(format!(
            "{head}\n  `{INVISIBLE_PK_COLUMN}` bigint unsigned NOT NULL AUTO_INCREMENT /*!80023 INVISIBLE */ PRIMARY KEY,{tail}"
        ))
    }

    /// Whether tables without a primary key are accepted silently.
    pub fn ignores_missing_primary_keys(&self) -> bool {
        self.has(CompatibilityOption::IgnoreMissingPks)
            || self.has(CompatibilityOption::CreateInvisiblePks)
    }

    /// Filters one `GRANT` statement. `None` drops it entirely.
    pub fn rewrite_grant(&self, grant: &str) -> Option<String> {
        if !self.has(CompatibilityOption::StripRestrictedGrants) {
            return Some(grant.to_string());
        }
        let Some(caps) = GRANT_RE.captures(grant) else {
            return Some(grant.to_string());
        };
        let privileges = &caps[1];
        let target = &caps[2];

        let kept: Vec<&str> = split_privileges(privileges)
            .into_iter()
            .filter(|p| !is_restricted(p))
            .collect();
        if kept.is_empty() {
            return None;
        }
        Some(format!("GRANT {} ON {}", kept.join(", "), target))
    }

    /// False for accounts that have to be left out of the dump.
    pub fn account_allowed(&self, create_user: &str) -> bool {
        if !self.has(CompatibilityOption::SkipInvalidAccounts) {
            return true;
        }
        match AUTH_PLUGIN_RE.captures(create_user) {
            Some(caps) => {
                let plugin = caps[1].to_ascii_lowercase();
                caps.get(2).is_some() && !EXTERNAL_AUTH_PLUGINS.contains(&plugin.as_str())
            }
            None => false,
        }
    }
}

fn strip_definer(ddl: &str) -> String {
    let stripped = DEFINER_RE.replace_all(ddl, "");
    SQL_SECURITY_RE
        .replace_all(&stripped, "SQL SECURITY INVOKER")
        .into_owned()
}

fn force_innodb(ddl: &str) -> String {
    ENGINE_RE
        .replace_all(ddl, |caps: &regex::Captures| {
            if caps[1].eq_ignore_ascii_case("MyISAM") || caps[1].eq_ignore_ascii_case("Aria") {
                "ENGINE=InnoDB".to_string()
            } else {
                caps[0].to_string()
            }
        })
        .into_owned()
}

/// Splits a privilege list on top-level commas; column lists stay intact.
fn split_privileges(list: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (idx, ch) in list.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(list[start..idx].trim());
                start = idx + 1;
            }
            _ => {}
        }
    }
    parts.push(list[start..].trim());
    parts.retain(|p| !p.is_empty());
    parts
}

fn is_restricted(privilege: &str) -> bool {
    let name = privilege
        .split('(')
        .next()
        .unwrap_or(privilege)
        .trim()
        .to_ascii_uppercase();
    RESTRICTED_PRIVILEGES.contains(&name.as_str())
}
