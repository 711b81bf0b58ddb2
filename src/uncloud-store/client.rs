//! HTTP/2 transport for the store (spec §4.B): `Exec`/`ExecMulti`,
//! `Query`, `Subscribe`/`Resubscribe`, `DBVersion`. Wrapped in the
//! shared transport-level exponential backoff, retrying only on
//! network-operation errors (connect/read/write failures); anything
//! that reaches the server and comes back as a decodable error is
//! permanent.

use std::pin::Pin;
use std::sync::{atomic::{AtomicU64, Ordering}, Arc};

use futures_util::{Stream, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;

use uncloud_util::backoff::Backoff;
use uncloud_util::{Error, ErrorKind};

use crate::rows::{ExecResult, QueryFrame, Rows};
use crate::subscription::{SubscribeFrame, Subscription};

#[derive(Serialize)]
struct QueryRequest<'a> {
	stmt: &'a str,
	args: &'a [Value],
}

#[derive(Serialize)]
struct ExecRequest<'a> {
	stmts: &'a [(&'a str, &'a [Value])],
}

#[derive(Serialize)]
struct SubscribeRequest<'a> {
	stmt: &'a str,
	args: &'a [Value],
	skip_rows: bool,
}

#[derive(Serialize)]
struct ResubscribeRequest<'a> {
	stmt: &'a str,
	args: &'a [Value],
	from_change: u64,
}

pub struct StoreClient {
	base_url: String,
	http: reqwest::Client,
	next_subscription_id: AtomicU64,
}

impl StoreClient {
	pub fn new(base_url: impl Into<String>) -> Result<Arc<Self>, Error> {
		let http = reqwest::Client::builder()
			.http2_prior_knowledge()
			.build()
			.map_err(|e| Error::new(ErrorKind::ConfigInvalid, e))?;
		Ok(Arc::new(StoreClient {
			base_url: base_url.into(),
			http,
			next_subscription_id: AtomicU64::new(1),
		}))
	}

	async fn with_retry<F, Fut, T>(&self, mut attempt: F) -> Result<T, Error>
	where
		F: FnMut() -> Fut,
		Fut: std::future::Future<Output = Result<T, Error>>,
	{
		let mut backoff = Backoff::transport();
		loop {
			match attempt().await {
				Ok(v) => return Ok(v),
				Err(e) if Self::is_transport_retryable(&e) => {
					if !backoff.wait().await {
						return Err(e);
					}
				}
				Err(e) => return Err(e),
			}
		}
	}

	fn is_transport_retryable(e: &Error) -> bool {
		matches!(e.kind(), ErrorKind::StoreUnavailable)
	}

	fn map_reqwest_err(e: reqwest::Error) -> Error {
		if e.is_connect() || e.is_timeout() || e.is_request() {
			Error::new(ErrorKind::StoreUnavailable, e)
		} else {
			Error::new(ErrorKind::StoreProtocol, e)
		}
	}

	pub async fn exec(&self, stmt: &str, args: &[Value]) -> Result<ExecResult, Error> {
		self.exec_multi(&[(stmt, args)]).await
	}

	pub async fn exec_multi(&self, stmts: &[(&str, &[Value])]) -> Result<ExecResult, Error> {
		self.with_retry(|| async {
			let resp = self
				.http
				.post(format!("{}/exec", self.base_url))
				.json(&ExecRequest { stmts })
				.send()
				.await
				.map_err(Self::map_reqwest_err)?;

			let status = resp.status();
			let body = resp.bytes().await.map_err(Self::map_reqwest_err)?;

			if status.is_success() {
				let envelope = serde_json::from_slice::<ExecResult>(&body).map_err(Error::from)?;
				match envelope.first_error() {
					Some(e) => Err(e),
					None => Ok(envelope),
				}
			} else if status.as_u16() == 500 {
				match serde_json::from_slice::<ExecResult>(&body) {
					Ok(envelope) => match envelope.first_error() {
						Some(e) => Err(e),
						None => Err(Error::msg(
							ErrorKind::StoreProtocol,
							String::from_utf8_lossy(&body).into_owned(),
						)),
					},
					Err(_) => Err(Error::msg(
						ErrorKind::StoreProtocol,
						String::from_utf8_lossy(&body).into_owned(),
					)),
				}
			} else {
				Err(Error::msg(
					ErrorKind::StoreUnavailable,
					format!("unexpected status {}: {}", status, String::from_utf8_lossy(&body)),
				))
			}
		})
		.await
	}

	pub async fn query(&self, stmt: &str, args: &[Value]) -> Result<Rows, Error> {
		let stmt = stmt.to_string();
		let args = args.to_vec();
		self.with_retry(|| {
			let stmt = stmt.clone();
			let args = args.clone();
			async move {
				let resp = self
					.http
					.post(format!("{}/query", self.base_url))
					.json(&QueryRequest { stmt: &stmt, args: &args })
					.send()
					.await
					.map_err(Self::map_reqwest_err)?;
				if !resp.status().is_success() {
					return Err(Error::msg(
						ErrorKind::StoreUnavailable,
						format!("query failed with status {}", resp.status()),
					));
				}
				Ok(Rows::new(ndjson_stream::<QueryFrame>(resp)))
			}
		})
		.await
	}

	pub async fn subscribe(
		self: &Arc<Self>,
		stmt: &str,
		args: &[Value],
		skip_rows: bool,
	) -> Result<Subscription, Error> {
		let resp = self
			.http
			.post(format!("{}/subscribe", self.base_url))
			.json(&SubscribeRequest { stmt, args, skip_rows })
			.send()
			.await
			.map_err(Self::map_reqwest_err)?;
		if !resp.status().is_success() {
			return Err(Error::msg(
				ErrorKind::StoreUnavailable,
				format!("subscribe failed with status {}", resp.status()),
			));
		}
		let id = self.next_subscription_id.fetch_add(1, Ordering::Relaxed);
		Ok(Subscription::new(
			id,
			stmt.to_string(),
			args.to_vec(),
			self.clone(),
			ndjson_stream::<SubscribeFrame>(resp),
			skip_rows,
		))
	}

	pub(crate) async fn resubscribe_raw(
		&self,
		stmt: &str,
		args: &[Value],
		from_change: u64,
	) -> Result<Pin<Box<dyn Stream<Item = Result<SubscribeFrame, Error>> + Send>>, Error> {
		let resp = self
			.http
			.post(format!("{}/resubscribe", self.base_url))
			.json(&ResubscribeRequest { stmt, args, from_change })
			.send()
			.await
			.map_err(Self::map_reqwest_err)?;
		if !resp.status().is_success() {
			return Err(Error::msg(
				ErrorKind::StoreUnavailable,
				format!("resubscribe failed with status {}", resp.status()),
			));
		}
		Ok(ndjson_stream::<SubscribeFrame>(resp))
	}

	pub async fn db_version(&self) -> Result<u64, Error> {
		#[derive(serde::Deserialize)]
		struct VersionResponse {
			version: u64,
		}
		self.with_retry(|| async {
			let resp = self
				.http
				.get(format!("{}/version", self.base_url))
				.send()
				.await
				.map_err(Self::map_reqwest_err)?;
			let v: VersionResponse = resp.json().await.map_err(Self::map_reqwest_err)?;
			Ok(v.version)
		})
		.await
	}
}

/// Decode a streamed HTTP body as newline-delimited JSON frames.
fn ndjson_stream<T>(
	resp: reqwest::Response,
) -> Pin<Box<dyn Stream<Item = Result<T, Error>> + Send>>
where
	T: for<'de> serde::Deserialize<'de> + Send + 'static,
{
	let byte_stream = resp
		.bytes_stream()
		.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
	let reader = StreamReader::new(byte_stream);
	let lines = FramedRead::new(reader, LinesCodec::new());
	Box::pin(lines.map(|line| {
		let line = line.map_err(|e| Error::new(ErrorKind::StoreProtocol, e))?;
		if line.trim().is_empty() {
			return Err(Error::msg(ErrorKind::StoreProtocol, "empty frame"));
		}
		serde_json::from_str::<T>(&line).map_err(Error::from)
	}))
}
