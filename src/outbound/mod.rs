//! Outbound deliverer and the transport seam it drives.

pub mod deliverer;
pub mod transport;

pub use deliverer::{
    BatchSendResult, DelivererHealth, OutboundDeliverer, OutboundRequest, SendOutcome, SkipReason,
    spawn_cleanup_task,
};
pub use transport::Transport;
