use crate::error::ConfigError;
use model::dump::dialect::Dialect;
use serde::Deserialize;

/// A dialect preset with optional per-field overrides.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DialectConfig {
    pub dialect: String,
    pub fields_terminated_by: Option<String>,
    pub fields_enclosed_by: Option<String>,
    pub fields_optionally_enclosed: Option<bool>,
    pub fields_escaped_by: Option<String>,
    pub lines_terminated_by: Option<String>,
}

impl Default for DialectConfig {
    fn default() -> Self {
        Self {
            dialect: "default".into(),
            fields_terminated_by: None,
            fields_enclosed_by: None,
            fields_optionally_enclosed: None,
            fields_escaped_by: None,
            lines_terminated_by: None,
        }
    }
}

fn single_byte(field: &'static str, value: &str) -> Result<Option<u8>, ConfigError> {
    match value.as_bytes() {
        [] => Ok(None),
        [b] => Ok(Some(*b)),
        _ => Err(ConfigError::invalid(field, "must be empty or a single character")),
    }
}

impl DialectConfig {
    pub fn resolve(&self) -> Result<Dialect, ConfigError> {
        let mut dialect = Dialect::by_name(&self.dialect)?;
        if let Some(v) = &self.fields_terminated_by {
            dialect.fields_terminated_by = v.clone();
        }
        if let Some(v) = &self.fields_enclosed_by {
            dialect.fields_enclosed_by = single_byte("fieldsEnclosedBy", v)?;
        }
        if let Some(v) = self.fields_optionally_enclosed {
            dialect.fields_optionally_enclosed = v;
        }
        if let Some(v) = &self.fields_escaped_by {
            dialect.fields_escaped_by = single_byte("fieldsEscapedBy", v)?;
        }
        if let Some(v) = &self.lines_terminated_by {
            dialect.lines_terminated_by = v.clone();
        }
        dialect.validate()?;
        Ok(dialect)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_apply_on_top_of_preset() {
        let cfg: DialectConfig =
            serde_json::from_str(r#"{"dialect":"csv","linesTerminatedBy":"\n"}"#).unwrap();
        let dialect = cfg.resolve().unwrap();
        assert_eq!(dialect.fields_terminated_by, ",");
        assert_eq!(dialect.lines_terminated_by, "\n");
        assert_eq!(dialect.extension, "csv");
    }

    #[test]
    fn rejects_bad_values() {
        let cfg = DialectConfig {
            fields_enclosed_by: Some("''".into()),
            ..Default::default()
        };
        assert!(cfg.resolve().is_err());
        let cfg = DialectConfig {
            dialect: "parquet".into(),
            ..Default::default()
        };
        assert!(matches!(cfg.resolve(), Err(ConfigError::Dialect(_))));
    }
}
