//! Sealed error-kind enum (spec §7). Every fallible operation in the
//! daemon returns `uncloud_util::Error`; the `kind()` accessor lets
//! logging callsites and the controller decide severity and whether a
//! failure is fatal, local-recoverable, or just logged and skipped,
//! without downcasting.

use std::fmt;

/// Category of error, used for logging severity and controller-level
/// fatal/non-fatal dispatch. New variants are expected over time, so this
/// enum is non-exhaustive even within the workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
	ConfigInvalid,
	StatePersistFailed,
	TunnelProgramFailed,
	StoreUnavailable,
	StoreProtocol,
	/// Malformed store row: skipped by readers, never fatal.
	StoreRowMalformed,
	/// Subscription change-id gap: triggers a resubscribe attempt.
	SubscriptionGap,
	RuntimeUnavailable,
	/// UDP DNS bind failure: fatal to the controller.
	DnsBindFatal,
	/// TCP DNS bind failure: component degrades gracefully.
	DnsBindDegraded,
	/// One peer's config was invalid; other peers still proceed.
	PeerConfigInvalid,
	/// Control API failed to bind either listener: fatal to the
	/// controller.
	ApiBindFailed,
	Canceled,
	Other,
}

impl fmt::Display for ErrorKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			ErrorKind::ConfigInvalid => "config invalid",
			ErrorKind::StatePersistFailed => "state persist failed",
			ErrorKind::TunnelProgramFailed => "tunnel program failed",
			ErrorKind::StoreUnavailable => "store unavailable",
			ErrorKind::StoreProtocol => "store protocol error",
			ErrorKind::StoreRowMalformed => "store row malformed",
			ErrorKind::SubscriptionGap => "subscription gap",
			ErrorKind::RuntimeUnavailable => "container runtime unavailable",
			ErrorKind::DnsBindFatal => "dns bind failed (fatal)",
			ErrorKind::DnsBindDegraded => "dns bind failed (degraded)",
			ErrorKind::PeerConfigInvalid => "peer config invalid",
			ErrorKind::ApiBindFailed => "control api bind failed",
			ErrorKind::Canceled => "canceled",
			ErrorKind::Other => "error",
		};
		write!(f, "{}", s)
	}
}

/// The workspace-wide error type. Carries a [`ErrorKind`] plus the causal
/// chain; `Display` always shows the underlying message, `kind()` is used
/// for dispatch.
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {source}")]
pub struct Error {
	kind: ErrorKind,
	#[source]
	source: anyhow::Error,
}

impl Error {
	pub fn new(kind: ErrorKind, source: impl Into<anyhow::Error>) -> Self {
		Self {
			kind,
			source: source.into(),
		}
	}

	pub fn msg(kind: ErrorKind, msg: impl Into<String>) -> Self {
		Self {
			kind,
			source: anyhow::Error::msg(msg.into()),
		}
	}

	pub fn kind(&self) -> ErrorKind {
		self.kind
	}

	/// True for errors that should abort controller startup or trigger
	/// the supervisor error-group cancellation (spec §7 "Surfaced to the
	/// controller (fatal)").
	pub fn is_fatal(&self) -> bool {
		matches!(
			self.kind,
			ErrorKind::TunnelProgramFailed
				| ErrorKind::DnsBindFatal
				| ErrorKind::StatePersistFailed
				| ErrorKind::ConfigInvalid
				| ErrorKind::ApiBindFailed
		)
	}

	pub fn is_canceled(&self) -> bool {
		self.kind == ErrorKind::Canceled
	}
}

impl From<std::io::Error> for Error {
	fn from(e: std::io::Error) -> Self {
		Error::new(ErrorKind::Other, e)
	}
}

impl From<serde_json::Error> for Error {
	fn from(e: serde_json::Error) -> Self {
		Error::new(ErrorKind::StoreProtocol, e)
	}
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
