//! Row cursor and exec result types for `Query`/`Exec` (spec §4.B).
//! Column values are arbitrary JSON fragments; `Rows::scan` deserializes
//! them into caller types via `serde_json::from_value`.

use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use std::pin::Pin;

use uncloud_util::{Error, ErrorKind};

/// One frame of a streamed query response body (newline-delimited JSON).
#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum QueryFrame {
	Columns(Vec<String>),
	Row(Vec<Value>),
	End { query_time_ms: u64, change_id: Option<u64> },
	Err(String),
}

/// Column names of the most recently started query.
#[derive(Debug, Clone, Default)]
pub struct Columns(pub Vec<String>);

impl Columns {
	pub fn position(&self, name: &str) -> Option<usize> {
		self.0.iter().position(|c| c == name)
	}
}

/// Metadata carried by a query's trailing end-of-query marker.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryTrailer {
	pub query_time_ms: u64,
	pub change_id: Option<u64>,
}

/// Server-streamed row sequence returned by `Query`.
pub struct Rows {
	pub(crate) inner: Pin<Box<dyn Stream<Item = Result<QueryFrame, Error>> + Send>>,
	columns: Columns,
	current: Option<Vec<Value>>,
	trailer: Option<QueryTrailer>,
	done: bool,
}

impl Rows {
	pub(crate) fn new(
		inner: Pin<Box<dyn Stream<Item = Result<QueryFrame, Error>> + Send>>,
	) -> Self {
		Rows {
			inner,
			columns: Columns::default(),
			current: None,
			trailer: None,
			done: false,
		}
	}

	pub fn columns(&self) -> &Columns {
		&self.columns
	}

	pub fn trailer(&self) -> Option<QueryTrailer> {
		self.trailer
	}

	/// Advance to the next row. Returns `Ok(false)` once the end-of-query
	/// marker has been consumed; an `Err` from the stream is returned and
	/// also terminates iteration.
	pub async fn next(&mut self) -> Result<bool, Error> {
		if self.done {
			return Ok(false);
		}
		loop {
			match self.inner.next().await {
				None => {
					self.done = true;
					return Ok(false);
				}
				Some(Err(e)) => {
					self.done = true;
					return Err(e);
				}
				Some(Ok(QueryFrame::Columns(columns))) => {
					self.columns = Columns(columns);
					continue;
				}
				Some(Ok(QueryFrame::Row(row))) => {
					self.current = Some(row);
					return Ok(true);
				}
				Some(Ok(QueryFrame::End { query_time_ms, change_id })) => {
					self.trailer = Some(QueryTrailer { query_time_ms, change_id });
					self.done = true;
					return Ok(false);
				}
				Some(Ok(QueryFrame::Err(err))) => {
					self.done = true;
					return Err(Error::msg(ErrorKind::StoreProtocol, err));
				}
			}
		}
	}

	/// Deserialize the current row's columns into `T` by position.
	pub fn scan<T: for<'de> Deserialize<'de>>(&self, indices: &[usize]) -> Result<Vec<T>, Error> {
		let row = self
			.current
			.as_ref()
			.ok_or_else(|| Error::msg(ErrorKind::StoreProtocol, "scan called before next()"))?;
		indices
			.iter()
			.map(|&i| {
				let value = row.get(i).cloned().unwrap_or(Value::Null);
				serde_json::from_value(value).map_err(Error::from)
			})
			.collect()
	}

	/// Deserialize the whole current row into one value (e.g. a struct
	/// with `#[derive(Deserialize)]` mirroring the selected columns).
	pub fn scan_row<T: for<'de> Deserialize<'de>>(&self) -> Result<T, Error> {
		let row = self
			.current
			.as_ref()
			.ok_or_else(|| Error::msg(ErrorKind::StoreProtocol, "scan_row called before next()"))?;
		serde_json::from_value(Value::Array(row.clone())).map_err(Error::from)
	}
}

/// One statement's outcome within an `Exec`/`ExecMulti` envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct StatementResult {
	#[serde(default)]
	pub rows_affected: u64,
	#[serde(default)]
	pub last_insert_id: Option<i64>,
	#[serde(default)]
	pub error: Option<String>,
}

/// Full decoded envelope from `Exec`/`ExecMulti`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ExecResult {
	#[serde(default)]
	pub results: Vec<StatementResult>,
}

impl ExecResult {
	/// Aggregate every per-statement error into one error, if any failed.
	/// The envelope is still returned to the caller alongside this (spec
	/// §4.B: "surface... while still returning the envelope").
	pub fn first_error(&self) -> Option<Error> {
		let messages: Vec<&str> = self
			.results
			.iter()
			.filter_map(|r| r.error.as_deref())
			.collect();
		if messages.is_empty() {
			None
		} else {
			Some(Error::msg(ErrorKind::StoreProtocol, messages.join("; ")))
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn exec_result_aggregates_all_statement_errors() {
		let envelope = ExecResult {
			results: vec![
				StatementResult { rows_affected: 1, last_insert_id: None, error: None },
				StatementResult { rows_affected: 0, last_insert_id: None, error: Some("unique constraint".into()) },
				StatementResult { rows_affected: 0, last_insert_id: None, error: Some("fk violation".into()) },
			],
		};
		let err = envelope.first_error().unwrap();
		assert!(err.to_string().contains("unique constraint"));
		assert!(err.to_string().contains("fk violation"));
	}

	#[test]
	fn exec_result_with_no_errors_is_none() {
		let envelope = ExecResult {
			results: vec![StatementResult { rows_affected: 1, last_insert_id: Some(5), error: None }],
		};
		assert!(envelope.first_error().is_none());
	}
}
