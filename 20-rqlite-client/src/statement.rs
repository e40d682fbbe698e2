//! SQL statements with positional arguments, and their wire encoding.
//!
//! A statement travels as a JSON array: the SQL text first, then each
//! argument in order. A batch is an array of those arrays.

use std::fmt;

use serde::ser::{Serialize, SerializeSeq, Serializer};

use crate::error::{Error, Result};
use crate::value::Value;

/// Builds a [`Statement`] from SQL text and heterogeneous arguments.
///
/// ```
/// use rqlite_client::statement;
///
/// let stmt = statement!("INSERT INTO foo (id, name) VALUES (?, ?)", 1, "bob");
/// assert!(stmt.warning().is_none());
/// ```
#[macro_export]
macro_rules! statement {
    ($sql:expr $(,)?) => {
        $crate::Statement::new($sql)
    };
    ($sql:expr, $($param:expr),+ $(,)?) => {
        $crate::Statement::with_params($sql, vec![$($crate::Value::from($param)),+])
    };
}

/// An immutable SQL template plus positional arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    sql: String,
    params: Vec<Value>,
    warning: Option<String>,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self::with_params(sql, Vec::new())
    }

    /// Creates a statement. A placeholder/argument count mismatch is recorded
    /// as a warning rather than rejected; the store reports the real error.
    pub fn with_params(sql: impl Into<String>, params: Vec<Value>) -> Self {
        let sql = sql.into();
        let warning = placeholder_warning(&sql, params.len());
        Self {
            sql,
            params,
            warning,
        }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn params(&self) -> &[Value] {
        &self.params
    }

    pub fn warning(&self) -> Option<&str> {
        self.warning.as_deref()
    }

    /// Returns a new statement with `sql` and `params` appended.
    pub fn append(&self, sql: &str, params: Vec<Value>) -> Self {
        let mut all = self.params.clone();
        all.extend(params);
        Self::with_params(format!("{}{sql}", self.sql), all)
    }
}

fn placeholder_warning(sql: &str, supplied: usize) -> Option<String> {
    let expected = count_placeholders(sql);
    (expected != supplied).then(|| {
        format!("unexpected parameters count: {supplied}, expected: {expected}")
    })
}

/// Counts `?` outside single-quoted string literals.
fn count_placeholders(sql: &str) -> usize {
    let mut in_literal = false;
    let mut count = 0;
    for c in sql.chars() {
        match c {
            '\'' => in_literal = !in_literal,
            '?' if !in_literal => count += 1,
            _ => {}
        }
    }
    count
}

impl From<&str> for Statement {
    fn from(sql: &str) -> Self {
        Statement::new(sql)
    }
}

impl From<String> for Statement {
    fn from(sql: String) -> Self {
        Statement::new(sql)
    }
}

impl From<&Statement> for Statement {
    fn from(stmt: &Statement) -> Self {
        stmt.clone()
    }
}

/// Best-effort SQL with arguments substituted, for debugging only.
impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut params = self.params.iter();
        let mut in_literal = false;
        for c in self.sql.chars() {
            match c {
                '\'' => {
                    in_literal = !in_literal;
                    write!(f, "{c}")?;
                }
                '?' if !in_literal => match params.next() {
                    Some(value) => write!(f, "{value}")?,
                    None => write!(f, "?")?,
                },
                _ => write!(f, "{c}")?,
            }
        }
        Ok(())
    }
}

impl Serialize for Statement {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.params.len() + 1))?;
        seq.serialize_element(&self.sql)?;
        for param in &self.params {
            seq.serialize_element(param)?;
        }
        seq.end()
    }
}

/// Encodes a batch as the JSON request body.
pub fn encode(statements: &[Statement]) -> Result<Vec<u8>> {
    serde_json::to_vec(statements).map_err(Error::Encode)
}
