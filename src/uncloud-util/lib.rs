//! Utilities shared by every Uncloud daemon component: configuration,
//! the sealed error-kind enum, atomic on-disk persistence, time helpers,
//! and the retry/debounce primitives used by the reconcilers and the
//! store client.

pub mod backoff;
pub mod config;
pub mod debounce;
pub mod error;
pub mod persister;
pub mod time;
pub mod version;

pub use error::{Error, ErrorKind};
