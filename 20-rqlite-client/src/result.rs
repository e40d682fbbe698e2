//! Decoding store responses into write results and row cursors.
//!
//! A response carries one entry per submitted statement. Each entry is decoded
//! on its own: a failed statement becomes a result with its error attached and
//! never prevents its siblings from decoding.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::value::{FromValue, Value};

/// Which endpoint produced a response, and therefore how to read its entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Query,
    Write,
    /// Unified endpoint: every entry is classified by its own shape.
    Request,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    results: Vec<WireResult>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    sequence_number: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct WireResult {
    #[serde(default)]
    columns: Option<Vec<String>>,
    #[serde(default)]
    types: Vec<String>,
    #[serde(default)]
    values: Option<Vec<Vec<serde_json::Value>>>,
    #[serde(default)]
    last_insert_id: Option<i64>,
    #[serde(default)]
    rows_affected: Option<i64>,
    #[serde(default)]
    time: Option<f64>,
    #[serde(default)]
    error: Option<String>,
}

fn parse(body: &[u8]) -> Result<WireResponse> {
    let response: WireResponse = serde_json::from_slice(body).map_err(Error::Decode)?;
    match &response.error {
        Some(err) if response.results.is_empty() => Err(Error::Store(err.clone())),
        _ => Ok(response),
    }
}

/// One entry of a decoded response.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestResult {
    Query(QueryResult),
    Write(WriteResult),
    /// The statement failed and its kind cannot be told from the payload.
    Error(String),
}

impl RequestResult {
    pub fn error(&self) -> Option<&str> {
        match self {
            RequestResult::Query(q) => q.error(),
            RequestResult::Write(w) => w.error(),
            RequestResult::Error(err) => Some(err),
        }
    }
}

/// Decodes a response body into one result per submitted statement.
pub fn decode(body: &[u8], kind: OperationKind) -> Result<Vec<RequestResult>> {
    let response = parse(body)?;
    Ok(response
        .results
        .into_iter()
        .map(|entry| match kind {
            OperationKind::Query => RequestResult::Query(QueryResult::from_wire(entry)),
            OperationKind::Write => RequestResult::Write(WriteResult::from_wire(entry)),
            OperationKind::Request => classify(entry),
        })
        .collect())
}

fn classify(entry: WireResult) -> RequestResult {
    if entry.columns.is_some() || entry.values.is_some() {
        return RequestResult::Query(QueryResult::from_wire(entry));
    }
    if entry.rows_affected.is_some() || entry.last_insert_id.is_some() {
        return RequestResult::Write(WriteResult::from_wire(entry));
    }
    match entry.error {
        Some(err) => RequestResult::Error(err),
        None => RequestResult::Write(WriteResult::from_wire(entry)),
    }
}

pub(crate) fn decode_queries(body: &[u8]) -> Result<Vec<QueryResult>> {
    Ok(parse(body)?
        .results
        .into_iter()
        .map(QueryResult::from_wire)
        .collect())
}

pub(crate) fn decode_writes(body: &[u8]) -> Result<Vec<WriteResult>> {
    Ok(parse(body)?
        .results
        .into_iter()
        .map(WriteResult::from_wire)
        .collect())
}

/// The sequence number the store assigned to a queued batch.
pub(crate) fn decode_sequence_number(body: &[u8]) -> Result<i64> {
    let response = parse(body)?;
    if let Some(err) = response.results.iter().find_map(|r| r.error.clone()) {
        return Err(Error::Statement(err));
    }
    response
        .sequence_number
        .ok_or_else(|| Error::Store("no sequence number returned for queued writes".into()))
}

fn timing(seconds: Option<f64>) -> Option<Duration> {
    seconds.and_then(|secs| Duration::try_from_secs_f64(secs).ok())
}

/// Outcome of one write statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteResult {
    rows_affected: i64,
    last_insert_id: Option<i64>,
    timing: Option<Duration>,
    error: Option<String>,
    sequence_number: Option<i64>,
}

impl WriteResult {
    fn from_wire(entry: WireResult) -> Self {
        Self {
            rows_affected: entry.rows_affected.unwrap_or_default(),
            last_insert_id: entry.last_insert_id,
            timing: timing(entry.time),
            error: entry.error,
            sequence_number: None,
        }
    }

    /// Acknowledgement of a queued batch; nothing has been applied yet.
    pub(crate) fn queued(sequence_number: i64) -> Self {
        Self {
            sequence_number: Some(sequence_number),
            ..Self::default()
        }
    }

    pub fn rows_affected(&self) -> i64 {
        self.rows_affected
    }

    pub fn last_insert_id(&self) -> Option<i64> {
        self.last_insert_id
    }

    pub fn timing(&self) -> Option<Duration> {
        self.timing
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Set only when the write went through the store's queue.
    pub fn sequence_number(&self) -> Option<i64> {
        self.sequence_number
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cursor {
    BeforeFirst,
    At(usize),
    AfterLast,
}

/// Rows returned by one query statement, read through a forward-only cursor.
///
/// The cursor starts before the first row. Call [`next`](Self::next) before
/// reading; every row accessor fails with [`Error::CursorState`] while the
/// cursor is not on a row. Advancing takes `&mut self`, so a result is read by
/// one caller at a time; share rows by copying them out with
/// [`slice`](Self::slice) or [`map`](Self::map), not by sharing the cursor.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    columns: Vec<String>,
    types: Vec<String>,
    rows: Vec<Vec<Value>>,
    cursor: Cursor,
    timing: Option<Duration>,
    error: Option<String>,
}

/// Something a column can be scanned into.
pub trait ScanTarget {
    fn assign(&mut self, value: &Value) -> std::result::Result<(), String>;
}

impl<T: FromValue> ScanTarget for T {
    fn assign(&mut self, value: &Value) -> std::result::Result<(), String> {
        *self = T::from_value(value)?;
        Ok(())
    }
}

impl QueryResult {
    fn from_wire(entry: WireResult) -> Self {
        let rows = entry
            .values
            .unwrap_or_default()
            .into_iter()
            .map(|row| row.into_iter().map(Value::from_json).collect())
            .collect();
        Self {
            columns: entry.columns.unwrap_or_default(),
            types: entry.types,
            rows,
            cursor: Cursor::BeforeFirst,
            timing: timing(entry.time),
            error: entry.error,
        }
    }

    /// Advances to the next row. Returns false once the rows are exhausted,
    /// and keeps returning false.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> bool {
        let next = match self.cursor {
            Cursor::BeforeFirst => 0,
            Cursor::At(i) => i + 1,
            Cursor::AfterLast => return false,
        };
        if next < self.rows.len() {
            self.cursor = Cursor::At(next);
            true
        } else {
            self.cursor = Cursor::AfterLast;
            false
        }
    }

    fn row(&self) -> Result<&[Value]> {
        match self.cursor {
            Cursor::At(i) => Ok(&self.rows[i]),
            Cursor::BeforeFirst => Err(Error::CursorState("next() has not been called")),
            Cursor::AfterLast => Err(Error::CursorState("no rows left")),
        }
    }

    fn declared_type(&self, column: usize) -> &str {
        self.types.get(column).map(String::as_str).unwrap_or_default()
    }

    /// Copies the current row into `targets`, one per column, in order.
    ///
    /// ```no_run
    /// # fn demo(mut rows: rqlite_client::QueryResult) -> rqlite_client::Result<()> {
    /// let (mut id, mut name) = (0i64, String::new());
    /// while rows.next() {
    ///     rows.scan(&mut [&mut id, &mut name])?;
    /// }
    /// # Ok(())
    /// # }
    /// ```
    pub fn scan(&self, targets: &mut [&mut dyn ScanTarget]) -> Result<()> {
        let row = self.row()?;
        if targets.len() != row.len() {
            return Err(Error::TypeMismatch(format!(
                "wrong number of scan targets: got {}, want {}",
                targets.len(),
                row.len()
            )));
        }
        for (column, (target, raw)) in targets.iter_mut().zip(row).enumerate() {
            let value = self.scan_value(column, raw);
            target
                .assign(&value)
                .map_err(|err| Error::TypeMismatch(self.describe_column(column, err)))?;
        }
        Ok(())
    }

    /// Blob columns arrive base64 encoded; everything else is scanned raw.
    fn scan_value(&self, column: usize, raw: &Value) -> Value {
        let declared = self.declared_type(column);
        if declared.eq_ignore_ascii_case("blob") {
            raw.clone().with_declared_type(declared)
        } else {
            raw.clone()
        }
    }

    fn describe_column(&self, column: usize, err: String) -> String {
        match self.columns.get(column) {
            Some(name) => format!("column {column} ({name}): {err}"),
            None => format!("column {column}: {err}"),
        }
    }

    /// The current row keyed by column name, with date/time and blob columns
    /// converted according to their declared types.
    pub fn map(&self) -> Result<HashMap<String, Value>> {
        let row = self.row()?;
        Ok(self
            .columns
            .iter()
            .zip(row)
            .enumerate()
            .map(|(i, (name, value))| {
                (name.clone(), value.clone().with_declared_type(self.declared_type(i)))
            })
            .collect())
    }

    /// The current row's raw values.
    pub fn slice(&self) -> Result<Vec<Value>> {
        Ok(self.row()?.to_vec())
    }

    /// Reads one column of the current row.
    pub fn get<T: FromValue>(&self, column: usize) -> Result<T> {
        let row = self.row()?;
        let raw = row.get(column).ok_or_else(|| {
            Error::TypeMismatch(format!(
                "column index {column} out of range ({} columns)",
                row.len()
            ))
        })?;
        T::from_value(&self.scan_value(column, raw))
            .map_err(|err| Error::TypeMismatch(self.describe_column(column, err)))
    }

    pub fn get_by_name<T: FromValue>(&self, column: &str) -> Result<T> {
        self.row()?;
        let index = self
            .columns
            .iter()
            .position(|name| name == column)
            .ok_or_else(|| Error::TypeMismatch(format!("no column named {column:?}")))?;
        self.get(index)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Declared column types as reported by the store; may be empty.
    pub fn types(&self) -> &[String] {
        &self.types
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    /// Zero-based index of the current row, if the cursor is on one.
    pub fn row_number(&self) -> Option<usize> {
        match self.cursor {
            Cursor::At(i) => Some(i),
            _ => None,
        }
    }

    pub fn timing(&self) -> Option<Duration> {
        self.timing
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;

    const QUERY_BODY: &str = r#"{
        "results": [
            {
                "columns": ["id", "name", "score", "created", "avatar"],
                "types": ["integer", "text", "real", "datetime", "blob"],
                "values": [
                    [1, "fiona", 20.5, "2024-03-01 10:00:00", "aGVsbG8="],
                    [2.0, null, 3, 1709287200, null]
                ],
                "time": 0.0025
            },
            {"error": "no such table: nope"}
        ],
        "time": 0.003
    }"#;

    fn first_query() -> QueryResult {
        decode_queries(QUERY_BODY.as_bytes()).unwrap().remove(0)
    }

    #[test]
    fn test_empty_cursor() {
        let mut result = decode_queries(br#"{"results":[{"columns":["id"],"types":["integer"]}]}"#)
            .unwrap()
            .remove(0);
        let mut id = 0i64;
        assert!(matches!(result.scan(&mut [&mut id]), Err(Error::CursorState(_))));
        assert!(matches!(result.map(), Err(Error::CursorState(_))));
        assert!(!result.next());
        assert!(!result.next());
        assert!(matches!(result.slice(), Err(Error::CursorState(_))));
        assert_eq!(result.num_rows(), 0);
    }

    #[test]
    fn test_scan_rows() {
        let mut result = first_query();
        assert_eq!(result.num_rows(), 2);
        assert_eq!(result.timing(), Some(Duration::from_micros(2500)));

        let mut id = 0i64;
        let mut name: Option<String> = None;
        let mut score = 0f64;
        let mut created = Utc::now();
        let mut avatar: Option<Vec<u8>> = None;

        assert!(result.next());
        assert_eq!(result.row_number(), Some(0));
        result
            .scan(&mut [&mut id, &mut name, &mut score, &mut created, &mut avatar])
            .unwrap();
        assert_eq!(id, 1);
        assert_eq!(name.as_deref(), Some("fiona"));
        assert_eq!(score, 20.5);
        assert_eq!(created, Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap());
        assert_eq!(avatar.as_deref(), Some(b"hello".as_slice()));

        assert!(result.next());
        result
            .scan(&mut [&mut id, &mut name, &mut score, &mut created, &mut avatar])
            .unwrap();
        assert_eq!(id, 2);
        assert_eq!(name, None);
        assert_eq!(score, 3.0);
        assert_eq!(created, Utc.timestamp_opt(1_709_287_200, 0).unwrap());
        assert_eq!(avatar, None);

        assert!(!result.next());
        assert_eq!(result.row_number(), None);
        assert!(matches!(result.get::<i64>(0), Err(Error::CursorState(_))));
    }

    #[test]
    fn test_scan_checks_target_count_and_types() {
        let mut result = first_query();
        assert!(result.next());

        let mut id = 0i64;
        assert!(matches!(result.scan(&mut [&mut id]), Err(Error::TypeMismatch(_))));

        let err = result.get::<i64>(1).unwrap_err();
        assert!(err.to_string().contains("name"), "{err}");
    }

    #[test]
    fn test_map_applies_declared_types() {
        let mut result = first_query();
        assert!(result.next());
        let row = result.map().unwrap();
        assert_eq!(row["id"], Value::Integer(1));
        assert_eq!(
            row["created"],
            Value::Timestamp(Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap())
        );
        assert_eq!(row["avatar"], Value::Blob(b"hello".to_vec()));
        // map does not move the cursor
        assert_eq!(result.row_number(), Some(0));
        assert_eq!(result.get_by_name::<String>("name").unwrap(), "fiona");
    }

    #[test]
    fn test_partial_batch_failure_keeps_siblings() {
        let results = decode_queries(QUERY_BODY.as_bytes()).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].error(), None);
        assert_eq!(results[1].error(), Some("no such table: nope"));
        assert_eq!(results[1].num_rows(), 0);
    }

    #[test]
    fn test_decode_writes() {
        let body = br#"{"results":[
            {"last_insert_id":7,"rows_affected":1,"time":0.001},
            {"error":"UNIQUE constraint failed: t.id"},
            {"rows_affected":3}
        ]}"#;
        let writes = decode_writes(body).unwrap();
        assert_eq!(writes.len(), 3);
        assert_eq!(writes[0].last_insert_id(), Some(7));
        assert_eq!(writes[0].rows_affected(), 1);
        assert_eq!(writes[0].timing(), Some(Duration::from_millis(1)));
        assert_eq!(writes[1].error(), Some("UNIQUE constraint failed: t.id"));
        assert_eq!(writes[2].rows_affected(), 3);
        assert_eq!(writes[2].last_insert_id(), None);
    }

    #[test]
    fn test_decode_request_classifies_entries() {
        let body = br#"{"results":[
            {"columns":["n"],"types":["integer"],"values":[[5]]},
            {"last_insert_id":2,"rows_affected":1},
            {"error":"near \"SELEC\": syntax error"}
        ]}"#;
        let results = decode(body, OperationKind::Request).unwrap();
        assert!(matches!(&results[0], RequestResult::Query(q) if q.num_rows() == 1));
        assert!(matches!(&results[1], RequestResult::Write(w) if w.last_insert_id() == Some(2)));
        assert!(matches!(&results[2], RequestResult::Error(e) if e.contains("syntax error")));
        assert!(results[2].error().is_some());
    }

    #[test]
    fn test_store_level_error() {
        let err = decode_writes(br#"{"error":"database is locked"}"#).unwrap_err();
        assert!(matches!(err, Error::Store(msg) if msg == "database is locked"));
        assert!(matches!(decode_writes(b"<html>"), Err(Error::Decode(_))));
    }

    #[test]
    fn test_sequence_number() {
        assert_eq!(
            decode_sequence_number(br#"{"results":[],"sequence_number":1653314298877648934}"#)
                .unwrap(),
            1_653_314_298_877_648_934
        );
    }

    #[test]
    fn test_missing_sequence_number_is_store_error() {
        let err = decode_sequence_number(br#"{"results":[]}"#).unwrap_err();
        assert!(matches!(err, Error::Store(_)), "{err}");
    }
}
