pub mod container;
pub mod endpoint_watcher;
pub mod peer;

pub use container::{ContainerReconciler, SyncNowHandle};
pub use endpoint_watcher::EndpointWatcher;
pub use peer::PeerReconciler;
