//! `Subscribe`/`Resubscribe` (spec §4.B): a server-streamed rows section
//! followed by an open-ended change-event stream, with monotonic
//! `change_id` enforcement and resubscribe-on-gap recovery.

use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use std::pin::Pin;
use std::sync::Arc;

use uncloud_util::backoff::Backoff;
use uncloud_util::{Error, ErrorKind};

use crate::client::StoreClient;
use crate::rows::Columns;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
	Insert,
	Update,
	Delete,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChangeEvent {
	pub kind: ChangeKind,
	pub row_id: i64,
	#[serde(default)]
	pub values: Vec<serde_json::Value>,
	pub change_id: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum SubscribeFrame {
	Columns(Vec<String>),
	Row(Vec<serde_json::Value>),
	RowsEnd,
	Change(ChangeEvent),
	Err(String),
}

/// A live subscription: initial rows (optionally skipped), then an
/// unbounded stream of change events enforcing `change_id = prev + 1`.
pub struct Subscription {
	id: u64,
	stmt: String,
	args: Vec<serde_json::Value>,
	client: Arc<StoreClient>,
	inner: Pin<Box<dyn Stream<Item = Result<SubscribeFrame, Error>> + Send>>,
	last_change_id: Option<u64>,
	rows_read: bool,
}

impl Subscription {
	pub(crate) fn new(
		id: u64,
		stmt: String,
		args: Vec<serde_json::Value>,
		client: Arc<StoreClient>,
		inner: Pin<Box<dyn Stream<Item = Result<SubscribeFrame, Error>> + Send>>,
		skip_rows: bool,
	) -> Self {
		Subscription {
			id,
			stmt,
			args,
			client,
			inner,
			last_change_id: None,
			rows_read: skip_rows,
		}
	}

	pub fn id(&self) -> u64 {
		self.id
	}

	pub fn last_change_id(&self) -> Option<u64> {
		self.last_change_id
	}

	/// Drain the subscription's initial rows section (spec §4.B: "a
	/// server-streamed rows section (optionally skipped)"). Must be
	/// called, if at all, before the first call to [`Subscription::next`];
	/// a no-op returning an empty set if `skip_rows` was requested.
	pub async fn read_initial_rows(&mut self) -> Result<(Columns, Vec<Vec<serde_json::Value>>), Error> {
		let mut columns = Columns::default();
		let mut rows = Vec::new();
		if self.rows_read {
			return Ok((columns, rows));
		}
		loop {
			match self.inner.next().await {
				None => break,
				Some(Err(e)) => return Err(e),
				Some(Ok(SubscribeFrame::Columns(cols))) => columns = Columns(cols),
				Some(Ok(SubscribeFrame::Row(row))) => rows.push(row),
				Some(Ok(SubscribeFrame::RowsEnd)) => break,
				Some(Ok(SubscribeFrame::Err(err))) => {
					return Err(Error::msg(ErrorKind::StoreProtocol, err))
				}
				Some(Ok(SubscribeFrame::Change(_))) => {
					return Err(Error::msg(
						ErrorKind::StoreProtocol,
						"change event arrived before rows section ended",
					));
				}
			}
		}
		self.rows_read = true;
		Ok((columns, rows))
	}

	/// Pull the next change event, enforcing monotonic `change_id`. A gap
	/// triggers a resubscribe attempt (with its own backoff) if the
	/// client has a resubscriber configured; otherwise the gap error is
	/// surfaced directly.
	pub async fn next(&mut self) -> Result<Option<ChangeEvent>, Error> {
		loop {
			match self.inner.next().await {
				None => return Ok(None),
				Some(Err(e)) => return self.recover(e).await,
				Some(Ok(SubscribeFrame::Columns(_))) | Some(Ok(SubscribeFrame::Row(_))) => {
					// Rows section already consumed by `take_rows`; any
					// further row frames indicate a protocol error.
					return Err(Error::msg(
						ErrorKind::StoreProtocol,
						"unexpected row frame after rows section",
					));
				}
				Some(Ok(SubscribeFrame::RowsEnd)) => continue,
				Some(Ok(SubscribeFrame::Err(err))) => {
					return self.recover(Error::msg(ErrorKind::StoreProtocol, err)).await;
				}
				Some(Ok(SubscribeFrame::Change(event))) => {
					if let Some(prev) = self.last_change_id {
						if event.change_id != prev + 1 {
							return self
								.recover(Error::msg(
									ErrorKind::SubscriptionGap,
									format!("change_id gap: expected {}, got {}", prev + 1, event.change_id),
								))
								.await;
						}
					}
					self.last_change_id = Some(event.change_id);
					return Ok(Some(event));
				}
			}
		}
	}

	async fn recover(&mut self, err: Error) -> Result<Option<ChangeEvent>, Error> {
		if !matches!(err.kind(), ErrorKind::SubscriptionGap | ErrorKind::StoreProtocol) {
			return Err(err);
		}
		let from_change = self.last_change_id.unwrap_or(0);
		let mut backoff = Backoff::resubscribe();
		loop {
			match self
				.client
				.resubscribe_raw(&self.stmt, &self.args, from_change)
				.await
			{
				Ok(stream) => {
					self.inner = stream;
					return self.next().await;
				}
				Err(e) if e.is_fatal() => return Err(e),
				Err(e) => {
					if !backoff.wait().await {
						return Err(e);
					}
				}
			}
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn change_kind_deserializes_snake_case() {
		let e: ChangeEvent = serde_json::from_str(
			r#"{"kind":"insert","row_id":7,"values":[1,"a"],"change_id":3}"#,
		)
		.unwrap();
		assert_eq!(e.kind, ChangeKind::Insert);
		assert_eq!(e.row_id, 7);
		assert_eq!(e.change_id, 3);
	}
}
