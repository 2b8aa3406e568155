//! SQL values exchanged with the execution channel and rendered into patch scripts.

use std::fmt;

/// A single column value.
///
/// Temporal values arrive from the engine already formatted as text, which is
/// exactly what a patch script needs.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl SqlValue {
    /// Integer view of the value, parsing text when needed.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Int(v) => Some(*v),
            SqlValue::UInt(v) => i64::try_from(*v).ok(),
            SqlValue::Text(s) => s.trim().parse().ok(),
            SqlValue::Bytes(b) => std::str::from_utf8(b).ok()?.trim().parse().ok(),
            SqlValue::Null | SqlValue::Float(_) => None,
        }
    }

    /// Render the value as a MySQL literal.
    ///
    /// Integer columns are written unquoted; a value that does not parse as an
    /// integer is quoted rather than emitted raw.
    pub fn to_literal(&self, is_integer: bool) -> String {
        match self {
            SqlValue::Null => "NULL".to_string(),
            SqlValue::Int(v) => render_number(v.to_string(), is_integer),
            SqlValue::UInt(v) => render_number(v.to_string(), is_integer),
            SqlValue::Float(v) => render_number(v.to_string(), false),
            SqlValue::Text(s) => {
                if is_integer && is_integer_text(s) {
                    s.trim().to_string()
                } else {
                    quote_string(s)
                }
            }
            SqlValue::Bytes(b) => match std::str::from_utf8(b) {
                Ok(s) => SqlValue::Text(s.to_string()).to_literal(is_integer),
                Err(_) => hex_literal(b),
            },
        }
    }
}

fn render_number(text: String, is_integer: bool) -> String {
    if is_integer {
        text
    } else {
        quote_string(&text)
    }
}

fn is_integer_text(s: &str) -> bool {
    let s = s.trim();
    let digits = s.strip_prefix('-').unwrap_or(s);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

/// Single-quote a string using MySQL's escape rules.
pub fn quote_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        match c {
            '\0' => out.push_str("\\0"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '"' => out.push_str("\\\""),
            '\x1a' => out.push_str("\\Z"),
            _ => out.push(c),
        }
    }
    out.push('\'');
    out
}

fn hex_literal(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2 + 3);
    out.push_str("X'");
    for b in bytes {
        out.push_str(&format!("{:02X}", b));
    }
    out.push('\'');
    out
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Null => write!(f, "NULL"),
            SqlValue::Int(v) => write!(f, "{}", v),
            SqlValue::UInt(v) => write!(f, "{}", v),
            SqlValue::Float(v) => write!(f, "{}", v),
            SqlValue::Text(s) => write!(f, "{}", s),
            SqlValue::Bytes(b) => write!(f, "{}", String::from_utf8_lossy(b)),
        }
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Int(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<mysql_async::Value> for SqlValue {
    fn from(value: mysql_async::Value) -> Self {
        use mysql_async::Value;
        match value {
            Value::NULL => SqlValue::Null,
            Value::Int(v) => SqlValue::Int(v),
            Value::UInt(v) => SqlValue::UInt(v),
            Value::Float(v) => SqlValue::Float(v as f64),
            Value::Double(v) => SqlValue::Float(v),
            Value::Bytes(b) => match String::from_utf8(b) {
                Ok(s) => SqlValue::Text(s),
                Err(e) => SqlValue::Bytes(e.into_bytes()),
            },
            Value::Date(y, mo, d, h, mi, s, us) => {
                let mut text = format!("{:04}-{:02}-{:02}", y, mo, d);
                if h != 0 || mi != 0 || s != 0 || us != 0 {
                    text.push_str(&format!(" {:02}:{:02}:{:02}", h, mi, s));
                    if us != 0 {
                        text.push_str(&format!(".{:06}", us));
                    }
                }
                SqlValue::Text(text)
            }
            Value::Time(neg, days, h, mi, s, us) => {
                let hours = days * 24 + h as u32;
                let mut text = format!(
                    "{}{:02}:{:02}:{:02}",
                    if neg { "-" } else { "" },
                    hours,
                    mi,
                    s
                );
                if us != 0 {
                    text.push_str(&format!(".{:06}", us));
                }
                SqlValue::Text(text)
            }
        }
    }
}

impl From<&SqlValue> for mysql_async::Value {
    fn from(value: &SqlValue) -> Self {
        match value {
            SqlValue::Null => mysql_async::Value::NULL,
            SqlValue::Int(v) => mysql_async::Value::Int(*v),
            SqlValue::UInt(v) => mysql_async::Value::UInt(*v),
            SqlValue::Float(v) => mysql_async::Value::Double(*v),
            SqlValue::Text(s) => mysql_async::Value::Bytes(s.as_bytes().to_vec()),
            SqlValue::Bytes(b) => mysql_async::Value::Bytes(b.clone()),
        }
    }
}
