//! Overlay tunnel manager (spec §4.A). Owns the local tunnel interface:
//! peer set, per-peer endpoint candidate rotation driven by a liveness
//! state machine, and route/address programming. The actual interface
//! programming is behind the [`driver::TunnelDriver`] trait so the
//! liveness/rotation logic in [`Overlay`] can be unit-tested against
//! [`driver::MockDriver`] without a real network namespace, the way the
//! teacher's table engine is abstracted behind
//! `garage_table::replication::TableReplication`.

pub mod driver;
pub mod firewall;
pub mod overlay;
pub mod peer;
pub mod route;

pub use driver::TunnelDriver;
pub use overlay::{Overlay, OverlayConfig};
pub use peer::{Liveness, Peer, PublicKey};
