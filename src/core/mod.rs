//! Core shared types of the dispatch engine
//!
//! - [`Packet`]: the packet view the dispatcher consumes
//! - [`Flow`]: per-connection app-layer state
//! - [`AppLayerEvent`]: anomaly events raised by detection

pub mod event;
pub mod flow;
pub mod packet;

pub use event::{AppLayerEvent, AppLayerEventKind, AppLayerEvents};
pub use flow::{Flow, FlowFlags, SharedFlow};
pub use packet::{Direction, DirectionOverride, IpProtocol, Packet};
