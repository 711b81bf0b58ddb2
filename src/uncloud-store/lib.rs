//! Client for the cluster's replicated SQL store (spec §4.B): an
//! HTTP/2 exec/query/subscribe surface plus a length-delimited JSON
//! admin socket for reading SWIM membership state.

pub mod admin;
pub mod client;
pub mod rows;
pub mod subscription;

pub use admin::{cluster_membership_states, MemberState, MembershipMember};
pub use client::StoreClient;
pub use rows::{Columns, ExecResult, Rows};
pub use subscription::{ChangeEvent, ChangeKind, Subscription};
