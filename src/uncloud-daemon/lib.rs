pub mod api;
pub mod controller;
pub mod gossip;
pub mod reconciler;
pub mod state;

pub mod control_proto {
	tonic::include_proto!("uncloud.control");
}
