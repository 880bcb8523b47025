use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DialectError {
    #[error("Unterminated enclosed field in row {0}")]
    UnterminatedField(usize),

    #[error("Unknown dialect '{0}'")]
    Unknown(String),

    #[error("Field terminator must not be empty")]
    EmptyTerminator,
}

/// Text format of data files: terminators, enclosure and escaping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dialect {
    pub fields_terminated_by: String,
    pub fields_enclosed_by: Option<u8>,
    pub fields_optionally_enclosed: bool,
    pub fields_escaped_by: Option<u8>,
    pub lines_terminated_by: String,
    pub extension: String,
}

impl Default for Dialect {
    fn default() -> Self {
        Self::tsv()
    }
}

impl Dialect {
    pub fn tsv() -> Self {
        Self {
            fields_terminated_by: "\t".into(),
            fields_enclosed_by: None,
            fields_optionally_enclosed: false,
            fields_escaped_by: Some(b'\\'),
            lines_terminated_by: "\n".into(),
            extension: "tsv".into(),
        }
    }

    pub fn csv() -> Self {
        Self {
            fields_terminated_by: ",".into(),
            fields_enclosed_by: Some(b'"'),
            fields_optionally_enclosed: true,
            fields_escaped_by: Some(b'\\'),
            lines_terminated_by: "\r\n".into(),
            extension: "csv".into(),
        }
    }

    pub fn csv_unix() -> Self {
        Self {
            fields_terminated_by: ",".into(),
            fields_enclosed_by: Some(b'"'),
            fields_optionally_enclosed: false,
            fields_escaped_by: Some(b'\\'),
            lines_terminated_by: "\n".into(),
            extension: "csv".into(),
        }
    }

    pub fn by_name(name: &str) -> Result<Self, DialectError> {
        match name {
            "default" | "tsv" => Ok(Self::tsv()),
            "csv" => Ok(Self::csv()),
            "csv-unix" => Ok(Self::csv_unix()),
            other => Err(DialectError::Unknown(other.to_string())),
        }
    }

    pub fn validate(&self) -> Result<(), DialectError> {
        if self.fields_terminated_by.is_empty() || self.lines_terminated_by.is_empty() {
            return Err(DialectError::EmptyTerminator);
        }
        Ok(())
    }

    /// Append one encoded row, including the line terminator.
    pub fn encode_row(&self, values: &[Option<&[u8]>], out: &mut Vec<u8>) {
        for (idx, value) in values.iter().enumerate() {
            if idx > 0 {
                out.extend_from_slice(self.fields_terminated_by.as_bytes());
            }
            match value {
                None => match self.fields_escaped_by {
                    Some(esc) => {
                        out.push(esc);
                        out.push(b'N');
                    }
                    None => out.extend_from_slice(b"NULL"),
                },
                Some(bytes) => self.encode_field(bytes, out),
            }
        }
        out.extend_from_slice(self.lines_terminated_by.as_bytes());
    }

    fn encode_field(&self, bytes: &[u8], out: &mut Vec<u8>) {
        if let Some(enc) = self.fields_enclosed_by {
            out.push(enc);
        }

        let field_first = self.fields_terminated_by.as_bytes()[0];
        let line_first = self.lines_terminated_by.as_bytes()[0];

        for &b in bytes {
            match self.fields_escaped_by {
                Some(esc) => match b {
                    0 => out.extend_from_slice(&[esc, b'0']),
                    b'\t' => out.extend_from_slice(&[esc, b't']),
                    b'\n' => out.extend_from_slice(&[esc, b'n']),
                    b'\r' => out.extend_from_slice(&[esc, b'r']),
                    _ if b == esc => out.extend_from_slice(&[esc, esc]),
                    _ if Some(b) == self.fields_enclosed_by => out.extend_from_slice(&[esc, b]),
                    _ if self.fields_enclosed_by.is_none()
                        && (b == field_first || b == line_first) =>
                    {
                        out.extend_from_slice(&[esc, b])
                    }
                    _ => out.push(b),
                },
                None => {
                    if Some(b) == self.fields_enclosed_by {
                        out.push(b);
                    }
                    out.push(b);
                }
            }
        }

        if let Some(enc) = self.fields_enclosed_by {
            out.push(enc);
        }
    }

    /// Parse a whole data file into rows of nullable byte values.
    pub fn decode_rows(&self, data: &[u8]) -> Result<Vec<Vec<Option<Vec<u8>>>>, DialectError> {
        self.decode_prefix(data, true).map(|(rows, _)| rows)
    }

    /// Parses the complete rows at the start of `data` and returns them with
    /// the number of bytes they span. Unless `last` is set, a trailing row
    /// without its terminator is left for the next call.
    pub fn decode_prefix(
        &self,
        data: &[u8],
        last: bool,
    ) -> Result<(Vec<Vec<Option<Vec<u8>>>>, usize), DialectError> {
        let field_term = self.fields_terminated_by.as_bytes();
        let line_term = self.lines_terminated_by.as_bytes();
        let mut rows = Vec::new();
        let mut row: Vec<Option<Vec<u8>>> = Vec::new();
        let mut field = FieldBuf::default();
        let mut in_quotes = false;
        let mut i = 0;
        let mut consumed = 0;

        while i < data.len() {
            let b = data[i];

            if in_quotes {
                if let Some(esc) = self.fields_escaped_by
                    && b == esc
                    && i + 1 < data.len()
                {
                    field.push(unescape(data[i + 1]));
                    i += 2;
                    continue;
                }
                if Some(b) == self.fields_enclosed_by {
                    if self.fields_escaped_by.is_none() && data.get(i + 1) == Some(&b) {
                        field.push(b);
                        i += 2;
                    } else {
                        in_quotes = false;
                        i += 1;
                    }
                    continue;
                }
                field.push(b);
                i += 1;
                continue;
            }

            if data[i..].starts_with(field_term) {
                row.push(field.finish(self.fields_escaped_by.is_none()));
                i += field_term.len();
                continue;
            }
            if data[i..].starts_with(line_term) {
                row.push(field.finish(self.fields_escaped_by.is_none()));
                rows.push(std::mem::take(&mut row));
                i += line_term.len();
                consumed = i;
                continue;
            }
            if Some(b) == self.fields_enclosed_by && field.is_untouched() {
                in_quotes = true;
                field.quoted = true;
                i += 1;
                continue;
            }
            if let Some(esc) = self.fields_escaped_by
                && b == esc
                && i + 1 < data.len()
            {
                let next = data[i + 1];
                if next == b'N' && field.is_untouched() {
                    field.null_marker = true;
                } else {
                    field.push(unescape(next));
                }
                i += 2;
                continue;
            }
            field.push(b);
            i += 1;
        }

        if !last {
            return Ok((rows, consumed));
        }
        if in_quotes {
            return Err(DialectError::UnterminatedField(rows.len() + 1));
        }
        if !row.is_empty() || !field.is_untouched() {
            row.push(field.finish(self.fields_escaped_by.is_none()));
            rows.push(row);
        }
        Ok((rows, data.len()))
    }
}

fn unescape(b: u8) -> u8 {
    match b {
        b'0' => 0,
        b't' => b'\t',
        b'n' => b'\n',
        b'r' => b'\r',
        b'b' => 8,
        b'Z' => 26,
        other => other,
    }
}

#[derive(Default)]
struct FieldBuf {
    bytes: Vec<u8>,
    null_marker: bool,
    quoted: bool,
}

impl FieldBuf {
    fn push(&mut self, b: u8) {
        if self.null_marker {
            self.null_marker = false;
            self.bytes.push(b'N');
        }
        self.bytes.push(b);
    }

    fn is_untouched(&self) -> bool {
        self.bytes.is_empty() && !self.null_marker && !self.quoted
    }

    fn finish(&mut self, literal_null: bool) -> Option<Vec<u8>> {
        let field = std::mem::take(self);
        if field.null_marker {
            return None;
        }
        if literal_null && !field.quoted && field.bytes == b"NULL" {
            return None;
        }
        Some(field.bytes)
    }
}
