//! TCP transport context coordinated by the dispatcher
//!
//! Holds the per-flow session state the app-layer decisions hinge on:
//! half-stream detection latches, which side produced payload first, and
//! the queues of raw reassembled stream messages awaiting the detection
//! engine. The reassembly engine itself lives upstream and is reached
//! through the [`Reassembler`] seam.

use std::collections::VecDeque;

use thiserror::Error;

use crate::applayer::profiling::Profiler;
use crate::applayer::AppLayerThreadCtx;
use crate::core::{Direction, Flow, Packet, SharedFlow};

/// Failure inside a nested reassembly call
#[derive(Debug, Error)]
pub enum ReassemblyError {
    #[error("app-layer handoff failed while draining the {0} stream")]
    Handoff(Direction),
    #[error("reassembly window exceeded on the {0} stream")]
    WindowExceeded(Direction),
}

/// Seam to the TCP reassembly engine.
///
/// The dispatcher re-enters the reassembler exactly once: to drain the
/// opposing half-stream through the app layer when detection completes
/// on the side that spoke second.
pub trait Reassembler<P: Profiler> {
    /// Drive the half-stream carrying `dir` data through the app layer
    /// (ACK-driven mode)
    fn reassemble_applayer(
        &mut self,
        tctx: &mut AppLayerThreadCtx<P>,
        flow: &mut Flow,
        pkt: &mut Packet,
        dir: Direction,
    ) -> Result<(), ReassemblyError>;

    /// Same, for inline (IPS) mode
    fn reassemble_inline_applayer(
        &mut self,
        tctx: &mut AppLayerThreadCtx<P>,
        flow: &mut Flow,
        pkt: &mut Packet,
        dir: Direction,
    ) -> Result<(), ReassemblyError>;
}

/// Which side of a TCP flow produced payload first.
///
/// This is a state, not a direction: `Committed` records that payload
/// has been handed to a parser and the question is settled. Transitions
/// only move forward: `None` → `Dir` → `Both` → `Committed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataFirstSeen {
    /// No payload observed yet
    #[default]
    None,
    /// Payload seen in exactly one direction so far
    Dir(Direction),
    /// Payload seen in both directions
    Both,
    /// Payload has been forwarded to the app layer
    Committed,
}

impl DataFirstSeen {
    /// Record payload in `dir`; monotonic, a no-op once committed
    pub fn observe(&mut self, dir: Direction) {
        *self = match *self {
            DataFirstSeen::None => DataFirstSeen::Dir(dir),
            DataFirstSeen::Dir(seen) if seen != dir => DataFirstSeen::Both,
            other => other,
        };
    }

    /// Whether payload has been seen in `dir`
    pub fn contains(self, dir: Direction) -> bool {
        match self {
            DataFirstSeen::None => false,
            DataFirstSeen::Dir(seen) => seen == dir,
            DataFirstSeen::Both => true,
            DataFirstSeen::Committed => false,
        }
    }
}

/// One direction of a TCP flow
#[derive(Debug, Default)]
pub struct TcpStream {
    detection_completed: bool,
    no_reassembly: bool,
}

impl TcpStream {
    /// Protocol detection will not run again on this half-stream
    pub fn detection_completed(&self) -> bool {
        self.detection_completed
    }

    pub fn set_detection_completed(&mut self) {
        self.detection_completed = true;
    }

    /// Only the soft-rollback path clears the latch
    pub fn reset_detection_completed(&mut self) {
        self.detection_completed = false;
    }

    /// Reassembly has been switched off for this half-stream
    pub fn no_reassembly(&self) -> bool {
        self.no_reassembly
    }

    pub fn set_no_reassembly(&mut self) {
        self.no_reassembly = true;
    }
}

/// A reassembled, contiguous byte run for one direction of a flow
#[derive(Debug)]
pub struct StreamMsg {
    /// Back-reference to the owning flow; cleared by the intake
    pub flow: Option<SharedFlow>,
    /// Direction the bytes travelled in
    pub dir: Direction,
    /// Stream sequence number of the first byte
    pub seq: u32,
    /// The bytes
    pub data: Vec<u8>,
}

impl StreamMsg {
    pub fn new(flow: Option<SharedFlow>, dir: Direction, seq: u32, data: Vec<u8>) -> Self {
        Self {
            flow,
            dir,
            seq,
            data,
        }
    }
}

/// TCP session: the flow's transport context
#[derive(Debug, Default)]
pub struct TcpSession {
    /// Half-stream carrying to-server data
    pub client: TcpStream,
    /// Half-stream carrying to-client data
    pub server: TcpStream,
    /// Which side produced payload first
    pub data_first_seen_dir: DataFirstSeen,
    toserver_smsgs: VecDeque<StreamMsg>,
    toclient_smsgs: VecDeque<StreamMsg>,
}

impl TcpSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// The half-stream that carries data travelling in `dir`
    pub fn stream_for_data(&self, dir: Direction) -> &TcpStream {
        match dir {
            Direction::ToServer => &self.client,
            Direction::ToClient => &self.server,
        }
    }

    /// Mutable variant of [`stream_for_data`](Self::stream_for_data)
    pub fn stream_for_data_mut(&mut self, dir: Direction) -> &mut TcpStream {
        match dir {
            Direction::ToServer => &mut self.client,
            Direction::ToClient => &mut self.server,
        }
    }

    /// Record that payload was observed in `dir`
    pub fn note_data_seen(&mut self, dir: Direction) {
        self.data_first_seen_dir.observe(dir);
    }

    /// Append a reassembled stream message to the per-direction queue
    pub fn push_stream_msg(&mut self, smsg: StreamMsg) {
        match smsg.dir {
            Direction::ToServer => self.toserver_smsgs.push_back(smsg),
            Direction::ToClient => self.toclient_smsgs.push_back(smsg),
        }
    }

    /// Pop the oldest queued message for `dir`
    pub fn pop_stream_msg(&mut self, dir: Direction) -> Option<StreamMsg> {
        match dir {
            Direction::ToServer => self.toserver_smsgs.pop_front(),
            Direction::ToClient => self.toclient_smsgs.pop_front(),
        }
    }

    /// Number of queued messages for `dir`
    pub fn stream_msg_len(&self, dir: Direction) -> usize {
        match dir {
            Direction::ToServer => self.toserver_smsgs.len(),
            Direction::ToClient => self.toclient_smsgs.len(),
        }
    }
}
