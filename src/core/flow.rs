//! Per-connection flow record
//!
//! Carries the app-layer decision state the dispatcher works against:
//! committed and per-direction tentative protocol ids, the give-up and
//! detector-exhaustion latches, deferred-byte counters, the per-flow
//! parser state and the anomaly-event sink.

use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::Mutex;

use super::event::AppLayerEvents;
use super::packet::{Direction, IpProtocol};
use crate::protocols::parser::L7Parser;
use crate::protocols::AppProto;
use crate::stream::{DataFirstSeen, TcpSession};

/// Flow shared across workers; the UDP handler and the stream-message
/// intake lock it themselves, the TCP path runs under the caller's lock.
pub type SharedFlow = Arc<Mutex<Flow>>;

/// App-layer flags kept on the flow
#[derive(Debug, Clone, Copy, Default)]
pub struct FlowFlags {
    /// Sticky give-up bit: all further payload bypasses detection and
    /// parsing
    pub no_applayer_inspection: bool,
    /// Detection was attempted on this UDP flow (at most once per flow)
    pub alproto_detect_done: bool,
    pm_done: [bool; 2],
    pp_done: [bool; 2],
}

impl FlowFlags {
    pub fn is_pm_done(&self, dir: Direction) -> bool {
        self.pm_done[dir.index()]
    }

    pub fn set_pm_done(&mut self, dir: Direction) {
        self.pm_done[dir.index()] = true;
    }

    pub fn reset_pm_done(&mut self, dir: Direction) {
        self.pm_done[dir.index()] = false;
    }

    pub fn is_pp_done(&self, dir: Direction) -> bool {
        self.pp_done[dir.index()]
    }

    pub fn set_pp_done(&mut self, dir: Direction) {
        self.pp_done[dir.index()] = true;
    }

    pub fn reset_pp_done(&mut self, dir: Direction) {
        self.pp_done[dir.index()] = false;
    }

    /// Both detector families exhausted in both directions
    pub fn detection_exhausted(&self) -> bool {
        self.pm_done == [true, true] && self.pp_done == [true, true]
    }
}

/// Per-connection record
pub struct Flow {
    /// Initiator address
    pub src_ip: IpAddr,
    /// Responder address
    pub dst_ip: IpAddr,
    /// Initiator port
    pub src_port: u16,
    /// Responder port
    pub dst_port: u16,
    /// Transport protocol
    pub proto: IpProtocol,

    /// Committed app-layer protocol; `AppProto::UNKNOWN` until a
    /// detection call commits it
    pub alproto: AppProto,
    /// Tentative protocol for the to-server direction
    pub alproto_ts: AppProto,
    /// Tentative protocol for the to-client direction
    pub alproto_tc: AppProto,

    /// App-layer flags
    pub flags: FlowFlags,

    /// Bytes already handed to the parser while detection on the
    /// direction was still pending; non-zero only in that window
    pub data_al_so_far: [u32; 2],

    /// Per-flow parser state, created lazily on first parse
    pub alstate: Option<Box<dyn L7Parser>>,

    /// Anomaly-event sink
    pub events: AppLayerEvents,

    /// Transport context; present for TCP flows under reassembly
    pub protoctx: Option<TcpSession>,
}

impl Flow {
    /// Create a flow from its 5-tuple
    pub fn new(
        proto: IpProtocol,
        src_ip: IpAddr,
        src_port: u16,
        dst_ip: IpAddr,
        dst_port: u16,
    ) -> Self {
        Self {
            src_ip,
            dst_ip,
            src_port,
            dst_port,
            proto,
            alproto: AppProto::UNKNOWN,
            alproto_ts: AppProto::UNKNOWN,
            alproto_tc: AppProto::UNKNOWN,
            flags: FlowFlags::default(),
            data_al_so_far: [0, 0],
            alstate: None,
            events: AppLayerEvents::new(),
            protoctx: None,
        }
    }

    /// Tentative protocol id for a direction
    pub fn dir_alproto(&self, dir: Direction) -> AppProto {
        match dir {
            Direction::ToServer => self.alproto_ts,
            Direction::ToClient => self.alproto_tc,
        }
    }

    /// Set the tentative protocol id for a direction
    pub fn set_dir_alproto(&mut self, dir: Direction, alproto: AppProto) {
        match dir {
            Direction::ToServer => self.alproto_ts = alproto,
            Direction::ToClient => self.alproto_tc = alproto,
        }
    }

    /// Mark the flow un-inspectable; sticky
    pub fn set_no_applayer_inspection(&mut self) {
        self.flags.no_applayer_inspection = true;
    }

    /// Drop all app-layer parser state
    pub fn cleanup_applayer(&mut self) {
        self.alstate = None;
    }

    // Session helpers. The session is owned by the flow, so the
    // dispatcher mutates it through these rather than holding a second
    // borrow alongside the flow's own fields.

    /// Which side produced payload first, as tracked on the session
    pub fn session_first_seen(&self) -> DataFirstSeen {
        self.protoctx
            .as_ref()
            .map(|ssn| ssn.data_first_seen_dir)
            .unwrap_or(DataFirstSeen::None)
    }

    /// Overwrite the session's first-seen state
    pub fn set_session_first_seen(&mut self, seen: DataFirstSeen) {
        if let Some(ssn) = self.protoctx.as_mut() {
            ssn.data_first_seen_dir = seen;
        }
    }

    /// Latch detection-completed on the half-stream carrying `dir` data
    pub fn latch_detection_completed(&mut self, dir: Direction) {
        if let Some(ssn) = self.protoctx.as_mut() {
            ssn.stream_for_data_mut(dir).set_detection_completed();
        }
    }

    /// Latch detection-completed on both half-streams
    pub fn latch_detection_completed_both(&mut self) {
        if let Some(ssn) = self.protoctx.as_mut() {
            ssn.client.set_detection_completed();
            ssn.server.set_detection_completed();
        }
    }

    /// Clear the detection-completed latch for the half-stream carrying
    /// `dir` data (soft rollback only)
    pub fn reset_detection_completed(&mut self, dir: Direction) {
        if let Some(ssn) = self.protoctx.as_mut() {
            ssn.stream_for_data_mut(dir).reset_detection_completed();
        }
    }

    /// Tell the session to stop reassembling `dir` data
    pub fn set_session_no_reassembly(&mut self, dir: Direction) {
        if let Some(ssn) = self.protoctx.as_mut() {
            ssn.stream_for_data_mut(dir).set_no_reassembly();
        }
    }
}

impl std::fmt::Debug for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flow")
            .field("src", &(self.src_ip, self.src_port))
            .field("dst", &(self.dst_ip, self.dst_port))
            .field("proto", &self.proto)
            .field("alproto", &self.alproto)
            .field("alproto_ts", &self.alproto_ts)
            .field("alproto_tc", &self.alproto_tc)
            .field("flags", &self.flags)
            .field("data_al_so_far", &self.data_al_so_far)
            .field("has_alstate", &self.alstate.is_some())
            .finish()
    }
}
