//! l7gate: application-layer protocol detection and dispatch
//!
//! The junction between a TCP reassembler, a protocol detector and an L7
//! parser table inside an NIDS pipeline. Given reassembled stream chunks
//! or raw UDP datagrams for a tracked flow, the engine identifies the
//! application protocol and routes subsequent payload to the matching
//! parser, while defending the decision against evasion: interleaved
//! half-streams, gaps, direction-first parsers, conflicting detections
//! and detection that only ever completes on one side.
//!
//! # Architecture
//!
//! - [`core`]: packet view, flow record, anomaly events
//! - [`stream`]: TCP session state and the reassembler seam
//! - [`protocols`]: protocol registration, detection fingerprints and
//!   probes, the parser seam
//! - [`applayer`]: the dispatch core and per-worker contexts
//!
//! # Example
//!
//! ```ignore
//! use l7gate::applayer::{AppLayer, StreamFlags};
//! use l7gate::config::AppLayerConfig;
//!
//! let engine = AppLayer::setup(AppLayerConfig::default())?;
//! let mut tctx = engine.get_ctx_thread()?;
//!
//! // per reassembled chunk, with the flow lock held:
//! tctx.handle_tcp_data(&mut ra, &mut pkt, &mut flow, data, StreamFlags::start(dir))?;
//! ```

pub mod applayer;
pub mod config;
pub mod core;
pub mod protocols;
pub mod stream;

pub use crate::applayer::error::AppLayerError;
pub use crate::applayer::{
    handle_tcp_stream_msg, AppLayer, AppLayerBuilder, AppLayerThreadCtx, StreamFlags,
};
pub use crate::config::AppLayerConfig;
pub use crate::core::{Direction, Flow, IpProtocol, Packet, SharedFlow};
pub use crate::protocols::{AppProto, FirstDataDir, ProtocolDef};
pub use crate::stream::{DataFirstSeen, Reassembler, StreamMsg, TcpSession, TcpStream};
