use crate::core::utils::{encode_name, quote_identifier};
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc};

/// Stable identifier of a unit of work.
///
/// Identifiers are derived only from object names and chunk indexes, so the
/// same dump planned twice yields the same ids and a persisted progress log
/// can be intersected with a freshly computed task list.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(Arc<str>);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(Arc::from(id.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn chunk(object: &ObjectName, index: usize) -> Self {
        Self::new(format!("chunk:{}@{}", object.encoded(), index))
    }

    pub fn ddl(kind: &str, object: &ObjectName) -> Self {
        Self::new(format!("ddl:{kind}:{}", object.encoded()))
    }

    pub fn table_data(object: &ObjectName) -> Self {
        Self::new(format!("data:{}", object.encoded()))
    }

    pub fn indexes(object: &ObjectName) -> Self {
        Self::new(format!("index:{}", object.encoded()))
    }

    pub fn checksum(object: &ObjectName) -> Self {
        Self::new(format!("checksum:{}", object.encoded()))
    }

    pub fn binlog(sequence: u64, file: &str) -> Self {
        Self::new(format!("binlog:{sequence}:{file}"))
    }

    pub fn grants() -> Self {
        Self::new("grants")
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A schema-qualified object name. For schema-level objects `name` equals `schema`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectName {
    pub schema: String,
    pub name: String,
}

impl ObjectName {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    pub fn schema(schema: impl Into<String>) -> Self {
        let schema = schema.into();
        Self {
            name: schema.clone(),
            schema,
        }
    }

    /// `` `schema`.`name` ``
    pub fn quoted(&self) -> String {
        format!(
            "{}.{}",
            quote_identifier(&self.schema),
            quote_identifier(&self.name)
        )
    }

    /// File-system safe `schema@name`.
    pub fn encoded(&self) -> String {
        format!("{}@{}", encode_name(&self.schema), encode_name(&self.name))
    }

    /// Parses `schema.table`, honoring backtick quoting on either side.
    pub fn parse(qualified: &str) -> Option<Self> {
        let parts = split_qualified(qualified)?;
        match parts.as_slice() {
            [schema, name] => Some(Self::new(schema.clone(), name.clone())),
            _ => None,
        }
    }
}

impl fmt::Display for ObjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// Splits a dotted name, honouring backtick quoting.
pub fn split_qualified(input: &str) -> Option<Vec<String>> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = input.trim().chars().peekable();
    let mut quoted = false;

    while let Some(ch) = chars.next() {
        match ch {
            '`' if quoted && chars.peek() == Some(&'`') => {
                chars.next();
                current.push('`');
            }
            '`' => quoted = !quoted,
            '.' if !quoted => parts.push(std::mem::take(&mut current)),
            _ => current.push(ch),
        }
    }

    if quoted {
        return None;
    }
    parts.push(current);
    if parts.iter().any(|p| p.is_empty()) {
        return None;
    }
    Some(parts)
}
