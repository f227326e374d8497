//! App-layer protocol detection and dispatch
//!
//! The junction between the TCP reassembler, the protocol detector and
//! the L7 parser table. For every chunk of in-order payload the
//! dispatcher decides between running detection, running the committed
//! parser, forcing the opposing direction through first, giving up on
//! the flow, or raising an anomaly event.
//!
//! Entry points: [`AppLayerThreadCtx::handle_tcp_data`] for reassembled
//! TCP chunks (flow lock held by the caller),
//! [`AppLayerThreadCtx::handle_udp`] for raw datagrams (locks the flow
//! itself), and [`handle_tcp_stream_msg`] for raw stream messages headed
//! to the detection engine.

pub mod error;
pub mod profiling;

use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use crate::config::AppLayerConfig;
use crate::core::{AppLayerEventKind, Direction, Flow, IpProtocol, Packet, SharedFlow};
use crate::protocols::parser::{ParseError, ParserRegistry, ParserThreadCtx};
use crate::protocols::registry::{DetectRegistry, DetectThreadCtx, SetupError};
use crate::protocols::{defaults, AppProto, ProtocolDef};
use crate::stream::{DataFirstSeen, Reassembler, StreamMsg};

use error::AppLayerError;
use profiling::Profiler;

/// Flags describing one reassembled chunk
#[derive(Debug, Clone, Copy)]
pub struct StreamFlags {
    /// Direction the bytes travelled in
    pub dir: Direction,
    /// The chunk starts at the beginning of the half-stream (detection
    /// still pending on it)
    pub start: bool,
    /// A confirmed hole precedes these bytes
    pub gap: bool,
}

impl StreamFlags {
    /// Chunk at the start of a half-stream
    pub fn start(dir: Direction) -> Self {
        Self {
            dir,
            start: true,
            gap: false,
        }
    }

    /// Gap notification at the start of a half-stream
    pub fn gap(dir: Direction) -> Self {
        Self {
            dir,
            start: true,
            gap: true,
        }
    }

    /// Mid-stream chunk after detection completed
    pub fn data(dir: Direction) -> Self {
        Self {
            dir,
            start: false,
            gap: false,
        }
    }
}

/// Builder for the app-layer engine.
///
/// Protocols register once; registration feeds both the detection
/// registry (fingerprints, probes) and the parser table (direction
/// policy, state factory) and allocates the protocol id.
pub struct AppLayerBuilder {
    config: AppLayerConfig,
    detect: DetectRegistry,
    parsers: ParserRegistry,
}

impl AppLayerBuilder {
    pub fn new(config: AppLayerConfig) -> Self {
        Self {
            config,
            detect: DetectRegistry::new(),
            parsers: ParserRegistry::new(),
        }
    }

    /// Register one protocol
    pub fn register(mut self, def: ProtocolDef) -> Result<Self, SetupError> {
        let name = def.name;
        let ipproto = def.ipproto;
        let first_data_dir = def.first_data_dir;
        let make_state = def.make_state;

        let alproto = self.detect.register(def)?;
        self.parsers.register(crate::protocols::parser::ParserEntry {
            name,
            ipproto,
            alproto,
            first_data_dir,
            make_state,
        });
        Ok(self)
    }

    /// Register the built-in protocol set
    pub fn register_defaults(mut self) -> Result<Self, SetupError> {
        for def in defaults::definitions() {
            self = self.register(def)?;
        }
        Ok(self)
    }

    /// Compile the detection state and produce the engine
    pub fn build(mut self) -> Result<AppLayer, SetupError> {
        self.detect.prepare()?;
        Ok(AppLayer {
            detect: Arc::new(self.detect),
            parsers: Arc::new(self.parsers),
            config: self.config,
        })
    }
}

/// The app-layer engine: registries plus configuration, shared by all
/// workers
pub struct AppLayer {
    detect: Arc<DetectRegistry>,
    parsers: Arc<ParserRegistry>,
    config: AppLayerConfig,
}

impl AppLayer {
    /// Engine with the built-in protocol set
    pub fn setup(config: AppLayerConfig) -> Result<Self, SetupError> {
        AppLayerBuilder::new(config).register_defaults()?.build()
    }

    /// Start from an empty registry
    pub fn builder(config: AppLayerConfig) -> AppLayerBuilder {
        AppLayerBuilder::new(config)
    }

    /// Create the per-worker context.
    ///
    /// Builds the detector thread context and the parser thread context;
    /// if either construction fails nothing leaks (the partially built
    /// child is dropped) and the error propagates.
    pub fn get_ctx_thread<P: Profiler>(&self) -> Result<AppLayerThreadCtx<P>, SetupError> {
        let detect_tctx = self.detect.get_ctx_thread()?;
        let parse_tctx = self.parsers.get_ctx_thread();
        Ok(AppLayerThreadCtx {
            detect_tctx,
            parse_tctx,
            enabled: self.config.enabled,
            inline_mode: self.config.inline_mode,
            profile: P::default(),
        })
    }

    /// Protocol id for a registry name
    pub fn proto_by_name(&self, name: &str) -> AppProto {
        self.detect.proto_by_name(name)
    }

    /// Registry name for a protocol id
    pub fn proto_to_string(&self, alproto: AppProto) -> &'static str {
        self.detect.proto_to_string(alproto)
    }

    pub fn config(&self) -> &AppLayerConfig {
        &self.config
    }
}

/// Per-worker dispatch context
pub struct AppLayerThreadCtx<P: Profiler = profiling::NoopProfiler> {
    detect_tctx: DetectThreadCtx,
    parse_tctx: ParserThreadCtx,
    enabled: bool,
    inline_mode: bool,
    profile: P,
}

impl<P: Profiler> AppLayerThreadCtx<P> {
    /// Protocol id for a registry name
    pub fn proto_by_name(&self, name: &str) -> AppProto {
        self.detect_tctx.registry().proto_by_name(name)
    }

    /// Registry name for a protocol id
    pub fn proto_to_string(&self, alproto: AppProto) -> &'static str {
        self.detect_tctx.registry().proto_to_string(alproto)
    }

    /// Detection attempts made on this worker
    pub fn detect_calls(&self) -> u64 {
        self.detect_tctx.detect_calls()
    }

    /// Parser invocations made on this worker
    pub fn parse_calls(&self) -> u64 {
        self.parse_tctx.parse_calls()
    }

    /// This worker's profiling state
    pub fn profiler(&self) -> &P {
        &self.profile
    }

    /// Handle a chunk of in-order TCP payload for one direction.
    ///
    /// The caller holds the flow's write lock. The flow's transport
    /// context carries the session state; the half-stream is the one
    /// carrying data in `flags.dir`. Returns `Ok` when the bytes were
    /// consumed (possibly by being dropped deliberately); errors follow
    /// the classes on [`AppLayerError`] and never abort the process.
    pub fn handle_tcp_data<R: Reassembler<P>>(
        &mut self,
        ra: &mut R,
        pkt: &mut Packet,
        flow: &mut Flow,
        data: &[u8],
        flags: StreamFlags,
    ) -> Result<(), AppLayerError> {
        debug!(
            len = data.len(),
            dir = %flags.dir,
            start = flags.start,
            gap = flags.gap,
            "tcp data"
        );

        if !self.enabled || flow.flags.no_applayer_inspection {
            debug!("app-layer inspection disabled");
            return Ok(());
        }
        if flow.protoctx.is_none() {
            debug_assert!(false, "tcp dispatch without a transport context");
            debug!("tcp data without transport context, dropping");
            return Ok(());
        }

        let dir = flags.dir;
        let dir_alproto = flow.dir_alproto(dir);

        if dir_alproto.is_unknown() && flags.gap {
            // detection needs a clean prefix; this half-stream will
            // never provide one
            flow.latch_detection_completed(dir);
            flow.set_session_no_reassembly(dir);
            debug!(%dir, "gap at stream start, giving up detection on direction");
            return Ok(());
        }

        if dir_alproto.is_unknown() && flags.start {
            let already = if data.is_empty() {
                0
            } else {
                (flow.data_al_so_far[dir.index()] as usize).min(data.len())
            };

            let t0 = P::ENABLED.then(Instant::now);
            let detected = self
                .detect_tctx
                .detect(flow, data, IpProtocol::Tcp, dir);
            if let Some(t0) = t0 {
                self.profile.record_proto_detect(t0.elapsed());
            }
            flow.set_dir_alproto(dir, detected);

            if !detected.is_unknown() {
                self.commit_detection(ra, pkt, flow, data, dir, already)
            } else {
                self.detection_pending(flow, data, dir, already)
            }
        } else if !flow.alproto.is_unknown() {
            let alproto = flow.alproto;
            debug!(len = data.len(), %alproto, "stream data for committed protocol");
            let r = self.timed_parse(flow, alproto, dir, data);
            self.fail_flow_on_parse_error(flow, r)
        } else {
            // a start chunk should have committed a protocol before
            // mid-stream data shows up
            debug!("mid-stream data but no committed protocol, dropping");
            Ok(())
        }
    }

    /// Detection returned a protocol for this direction: reconcile,
    /// commit, enforce direction policy and feed the parser.
    fn commit_detection<R: Reassembler<P>>(
        &mut self,
        ra: &mut R,
        pkt: &mut Packet,
        flow: &mut Flow,
        data: &[u8],
        dir: Direction,
        already: usize,
    ) -> Result<(), AppLayerError> {
        let odir = dir.opposite();
        let detected = flow.dir_alproto(dir);
        let other = flow.dir_alproto(odir);

        if !other.is_unknown() && other != detected {
            self.reconcile_mismatch(flow, dir, detected, other);
        }
        let alproto = flow.dir_alproto(dir);
        flow.alproto = alproto;
        flow.latch_detection_completed(dir);

        // if the opposing side spoke first and its bytes have not been
        // through the app layer yet, they must go in before ours
        if let DataFirstSeen::Dir(first) = flow.session_first_seen() {
            if first != dir {
                if let Err(err) = self.drain_opposing(ra, pkt, flow, odir) {
                    flow.set_no_applayer_inspection();
                    flow.latch_detection_completed_both();
                    return Err(AppLayerError::OpposingDrain(err));
                }
            }
        }

        if flow.session_first_seen() != DataFirstSeen::Committed {
            let first_data_dir = self.parse_tctx.first_data_dir(flow.proto, alproto);

            if first_data_dir.is_constrained()
                && !first_data_dir.accepts_seen(flow.session_first_seen())
            {
                // the flow opened in a direction the parser refuses to
                // start from; a favorite evasion shape, so flag it
                flow.events.raise(AppLayerEventKind::WrongDirectionFirstData);
                flow.set_no_applayer_inspection();
                flow.latch_detection_completed_both();
                flow.set_session_first_seen(DataFirstSeen::Committed);
                debug!(%alproto, %dir, "first data in wrong direction");
                return Err(AppLayerError::WrongDirectionFirstData { proto: alproto });
            }

            // detection succeeded on the non-preferred side while the
            // preferred side's bytes are reassembled but not yet
            // deliverable; undo the decision and let the caller
            // re-present everything later
            if first_data_dir.is_constrained() && !first_data_dir.accepts_dir(dir) {
                debug_assert!(
                    flow.dir_alproto(odir).is_unknown(),
                    "rollback with a decided opposing direction"
                );
                self.parse_tctx.cleanup_flow(flow);
                flow.alproto = AppProto::UNKNOWN;
                flow.set_dir_alproto(dir, AppProto::UNKNOWN);
                flow.reset_detection_completed(dir);
                flow.flags.reset_pm_done(dir);
                flow.flags.reset_pp_done(dir);
                debug!(%dir, "deferring protocol decision until preferred direction delivers");
                return Err(AppLayerError::DetectionDeferred);
            }
        }

        flow.set_session_first_seen(DataFirstSeen::Committed);

        let r = self.timed_parse(flow, alproto, dir, &data[already..]);
        flow.data_al_so_far[dir.index()] = 0;
        self.fail_flow_on_parse_error(flow, r)
    }

    /// Detection failed for this direction: inherit the opposing
    /// direction's protocol if its parser tolerates us, park the bytes
    /// otherwise, and give up once every detector family has exhausted
    /// both directions.
    fn detection_pending(
        &mut self,
        flow: &mut Flow,
        data: &[u8],
        dir: Direction,
        already: usize,
    ) -> Result<(), AppLayerError> {
        let odir = dir.opposite();
        let other = flow.dir_alproto(odir);

        if !other.is_unknown() {
            let first_data_dir = self.parse_tctx.first_data_dir(flow.proto, other);
            if flow.session_first_seen() != DataFirstSeen::Committed
                && first_data_dir.is_constrained()
                && !first_data_dir.accepts_dir(dir)
            {
                flow.set_no_applayer_inspection();
                flow.latch_detection_completed_both();
                debug!(alproto = %other, %dir, "opposing parser refuses this direction first");
                return Err(AppLayerError::DirectionNotAccepted { proto: other });
            }

            if !data.is_empty() {
                flow.set_session_first_seen(DataFirstSeen::Committed);
            }

            let r = self.timed_parse(flow, other, dir, &data[already..]);

            if flow.flags.is_pm_done(dir) && flow.flags.is_pp_done(dir) {
                flow.events
                    .raise(AppLayerEventKind::DetectProtocolOnlyOneDirection);
                flow.latch_detection_completed(dir);
                flow.data_al_so_far[dir.index()] = 0;
            } else {
                // detection may still decide differently; remember how
                // much of the re-presented prefix the parser already saw
                flow.data_al_so_far[dir.index()] = data.len() as u32;
            }

            self.fail_flow_on_parse_error(flow, r)
        } else {
            if flow.flags.detection_exhausted() {
                debug!("both detector families exhausted in both directions, giving up");
                flow.set_no_applayer_inspection();
                flow.latch_detection_completed_both();
                flow.set_session_first_seen(DataFirstSeen::Committed);
            }
            Ok(())
        }
    }

    /// Resolve conflicting detections on the two half-streams.
    ///
    /// When a parser has already consumed bytes the earlier decision
    /// wins. Otherwise the tie-break is asymmetric: the current
    /// direction keeps its own result when it is to-client, and defers
    /// to the opposing side when it is to-server. Kept exactly as the
    /// original engine behaves, asymmetry and all.
    fn reconcile_mismatch(
        &mut self,
        flow: &mut Flow,
        dir: Direction,
        detected: AppProto,
        other: AppProto,
    ) {
        debug!(%dir, %detected, %other, "protocol mismatch between directions");
        flow.events
            .raise(AppLayerEventKind::MismatchProtocolBothDirections);

        if flow.session_first_seen() == DataFirstSeen::Committed {
            flow.set_dir_alproto(dir, other);
        } else if dir == Direction::ToClient {
            flow.set_dir_alproto(dir.opposite(), detected);
        } else {
            flow.set_dir_alproto(dir, other);
        }
    }

    /// Drive the opposing half-stream through the app layer.
    ///
    /// ACK-driven reassembly flushes a half-stream on packets flowing
    /// the other way; inline mode flushes on the data direction itself.
    /// The packet's direction is retagged for the nested call and
    /// restored on every exit path.
    fn drain_opposing<R: Reassembler<P>>(
        &mut self,
        ra: &mut R,
        pkt: &mut Packet,
        flow: &mut Flow,
        odir: Direction,
    ) -> Result<(), crate::stream::ReassemblyError> {
        debug!(%odir, "draining opposing stream before first parse");
        let drive_dir = if self.inline_mode { odir } else { odir.opposite() };
        let mut guard = pkt.override_direction(drive_dir);
        if self.inline_mode {
            ra.reassemble_inline_applayer(self, flow, &mut guard, odir)
        } else {
            ra.reassemble_applayer(self, flow, &mut guard, odir)
        }
    }

    fn timed_parse(
        &mut self,
        flow: &mut Flow,
        alproto: AppProto,
        dir: Direction,
        data: &[u8],
    ) -> Result<(), ParseError> {
        let t0 = P::ENABLED.then(Instant::now);
        let r = self.parse_tctx.parse(flow, alproto, dir, data);
        if let Some(t0) = t0 {
            self.profile.record_parse(alproto, t0.elapsed());
        }
        r
    }

    fn fail_flow_on_parse_error(
        &mut self,
        flow: &mut Flow,
        r: Result<(), ParseError>,
    ) -> Result<(), AppLayerError> {
        match r {
            Ok(()) => Ok(()),
            Err(err) => {
                flow.set_no_applayer_inspection();
                Err(err.into())
            }
        }
    }

    /// Handle a single UDP datagram for a flow.
    ///
    /// Takes the flow lock itself. Detection runs at most once per UDP
    /// flow regardless of outcome; afterwards datagrams go straight to
    /// the parser if a protocol was found.
    pub fn handle_udp(&mut self, pkt: &Packet, flow: &SharedFlow) -> Result<(), AppLayerError> {
        let r = {
            let mut guard = flow.lock();
            self.handle_udp_locked(pkt, &mut guard)
        };
        self.profile.finish_packet();
        r
    }

    fn handle_udp_locked(&mut self, pkt: &Packet, flow: &mut Flow) -> Result<(), AppLayerError> {
        if !self.enabled || flow.flags.no_applayer_inspection {
            return Ok(());
        }

        let dir = pkt.direction();

        if flow.alproto.is_unknown() && !flow.flags.alproto_detect_done {
            debug!(len = pkt.payload().len(), "detecting protocol on udp datagram");

            let t0 = P::ENABLED.then(Instant::now);
            let detected = self
                .detect_tctx
                .detect(flow, pkt.payload(), IpProtocol::Udp, dir);
            if let Some(t0) = t0 {
                self.profile.record_proto_detect(t0.elapsed());
            }

            flow.alproto = detected;
            flow.flags.alproto_detect_done = true;

            if !detected.is_unknown() {
                let r = self.timed_parse(flow, detected, dir, pkt.payload());
                self.fail_flow_on_parse_error(flow, r)
            } else {
                debug!("udp flow stays unknown");
                Ok(())
            }
        } else if !flow.alproto.is_unknown() {
            let alproto = flow.alproto;
            debug!(len = pkt.payload().len(), %alproto, "udp data for committed protocol");
            let r = self.timed_parse(flow, alproto, dir, pkt.payload());
            self.fail_flow_on_parse_error(flow, r)
        } else {
            debug!("udp flow started but no protocol was ever detected");
            Ok(())
        }
    }
}

/// Queue a raw reassembled stream message on its flow's session.
///
/// The message must carry a flow back-reference; it is cleared here in
/// every branch. Messages for flows without a transport context are
/// released.
pub fn handle_tcp_stream_msg(mut smsg: StreamMsg) -> Result<(), AppLayerError> {
    let Some(flow) = smsg.flow.take() else {
        debug_assert!(false, "stream message without flow reference");
        return Err(AppLayerError::MissingFlow);
    };

    let mut guard = flow.lock();
    match guard.protoctx.as_mut() {
        Some(ssn) => {
            debug!(dir = %smsg.dir, len = smsg.data.len(), "queueing stream message");
            ssn.push_stream_msg(smsg);
        }
        None => {
            // nothing will ever inspect it; dropping releases the buffer
            debug!("stream message for flow without session, releasing");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::profiling::{HistProfiler, NoopProfiler};
    use super::*;
    use crate::protocols::parser::{sink_state, SinkParser};
    use crate::protocols::{FirstDataDir, Pattern};
    use crate::stream::{ReassemblyError, TcpSession};
    use parking_lot::Mutex;
    use std::net::{IpAddr, Ipv4Addr};

    const HTTP_REQUEST: &[u8] = b"GET / HTTP/1.0\r\n\r\n";
    const HTTP_RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\n\r\n";

    /// Scripted stand-in for the reassembly engine. Optionally feeds a
    /// queued chunk back through the dispatcher when asked to drain a
    /// direction, the way the real engine re-enters the app layer.
    #[derive(Default)]
    struct MockReassembler {
        pending: Option<(Direction, Vec<u8>)>,
        calls: Vec<(Direction, Direction)>,
        fail: bool,
    }

    impl MockReassembler {
        fn with_pending(dir: Direction, data: &[u8]) -> Self {
            Self {
                pending: Some((dir, data.to_vec())),
                ..Self::default()
            }
        }

        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        fn drain<P: Profiler>(
            &mut self,
            tctx: &mut AppLayerThreadCtx<P>,
            flow: &mut Flow,
            pkt: &mut Packet,
            dir: Direction,
        ) -> Result<(), ReassemblyError> {
            self.calls.push((dir, pkt.direction()));
            if self.fail {
                return Err(ReassemblyError::Handoff(dir));
            }
            if self.pending.as_ref().map(|(d, _)| *d) == Some(dir) {
                let (pdir, data) = self.pending.take().unwrap();
                tctx.handle_tcp_data(self, pkt, flow, &data, StreamFlags::start(pdir))
                    .map_err(|_| ReassemblyError::Handoff(dir))?;
            }
            Ok(())
        }
    }

    impl<P: Profiler> Reassembler<P> for MockReassembler {
        fn reassemble_applayer(
            &mut self,
            tctx: &mut AppLayerThreadCtx<P>,
            flow: &mut Flow,
            pkt: &mut Packet,
            dir: Direction,
        ) -> Result<(), ReassemblyError> {
            self.drain(tctx, flow, pkt, dir)
        }

        fn reassemble_inline_applayer(
            &mut self,
            tctx: &mut AppLayerThreadCtx<P>,
            flow: &mut Flow,
            pkt: &mut Packet,
            dir: Direction,
        ) -> Result<(), ReassemblyError> {
            self.drain(tctx, flow, pkt, dir)
        }
    }

    fn echo_def() -> ProtocolDef {
        ProtocolDef {
            name: "echo",
            ipproto: IpProtocol::Tcp,
            ts_patterns: vec![],
            tc_patterns: vec![Pattern::prefix(b"ECHO")],
            probe_ts: None,
            probe_tc: None,
            default_port: None,
            first_data_dir: FirstDataDir::Any,
            make_state: sink_state,
        }
    }

    fn engine() -> AppLayer {
        AppLayer::builder(AppLayerConfig::default())
            .register_defaults()
            .unwrap()
            .register(echo_def())
            .unwrap()
            .build()
            .unwrap()
    }

    fn tctx(engine: &AppLayer) -> AppLayerThreadCtx<NoopProfiler> {
        engine.get_ctx_thread().unwrap()
    }

    fn tcp_flow() -> Flow {
        let mut flow = Flow::new(
            IpProtocol::Tcp,
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, 100)),
            49152,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            80,
        );
        flow.protoctx = Some(TcpSession::new());
        flow
    }

    fn udp_flow() -> SharedFlow {
        Arc::new(Mutex::new(Flow::new(
            IpProtocol::Udp,
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, 100)),
            49152,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            53,
        )))
    }

    fn tcp_packet(dir: Direction) -> Packet {
        Packet::new(
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, 100)),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            49152,
            80,
            IpProtocol::Tcp,
            dir,
            Vec::new(),
        )
    }

    fn udp_packet(dir: Direction, payload: &[u8]) -> Packet {
        Packet::new(
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, 100)),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            49152,
            53,
            IpProtocol::Udp,
            dir,
            payload.to_vec(),
        )
    }

    fn note_seen(flow: &mut Flow, dir: Direction) {
        flow.protoctx.as_mut().unwrap().note_data_seen(dir);
    }

    fn sink<'a>(flow: &'a Flow) -> &'a SinkParser {
        flow.alstate
            .as_ref()
            .expect("parser state")
            .as_any()
            .downcast_ref::<SinkParser>()
            .expect("sink state")
    }

    const DNS_QUERY: [u8; 17] = [
        0x12, 0x34, 0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x03, b'w', b'w',
        b'w', 0x00,
    ];

    // --- end-to-end flow shapes ---

    #[test]
    fn test_toserver_first_http_flow() {
        let engine = engine();
        let mut ctx = tctx(&engine);
        let http = ctx.proto_by_name("http");
        let mut ra = MockReassembler::default();
        let mut pkt = tcp_packet(Direction::ToClient);
        let mut flow = tcp_flow();
        note_seen(&mut flow, Direction::ToServer);

        ctx.handle_tcp_data(
            &mut ra,
            &mut pkt,
            &mut flow,
            HTTP_REQUEST,
            StreamFlags::start(Direction::ToServer),
        )
        .unwrap();

        assert_eq!(flow.alproto, http);
        assert_eq!(flow.alproto_ts, http);
        assert!(flow
            .protoctx
            .as_ref()
            .unwrap()
            .client
            .detection_completed());
        assert_eq!(sink(&flow).buffered(Direction::ToServer), HTTP_REQUEST);
        assert!(flow.events.is_empty());
        assert!(ra.calls.is_empty());
        assert_eq!(
            flow.session_first_seen(),
            DataFirstSeen::Committed
        );
    }

    #[test]
    fn test_gap_at_stream_start() {
        let engine = engine();
        let mut ctx = tctx(&engine);
        let mut ra = MockReassembler::default();
        let mut pkt = tcp_packet(Direction::ToClient);
        let mut flow = tcp_flow();

        ctx.handle_tcp_data(
            &mut ra,
            &mut pkt,
            &mut flow,
            b"",
            StreamFlags::gap(Direction::ToServer),
        )
        .unwrap();

        let ssn = flow.protoctx.as_ref().unwrap();
        assert!(ssn.client.detection_completed());
        assert!(ssn.client.no_reassembly());
        assert!(!ssn.server.detection_completed());
        assert_eq!(flow.alproto, AppProto::UNKNOWN);
        assert!(flow.alstate.is_none());
    }

    #[test]
    fn test_wrong_direction_first_data() {
        let engine = engine();
        let mut ctx = tctx(&engine);
        let mut ra = MockReassembler::default();
        let mut pkt = tcp_packet(Direction::ToServer);
        let mut flow = tcp_flow();
        // the flow opened with a server response; http insists on
        // seeing the request side first
        note_seen(&mut flow, Direction::ToClient);

        let err = ctx
            .handle_tcp_data(
                &mut ra,
                &mut pkt,
                &mut flow,
                HTTP_RESPONSE,
                StreamFlags::start(Direction::ToClient),
            )
            .unwrap_err();

        assert!(matches!(err, AppLayerError::WrongDirectionFirstData { .. }));
        assert!(flow
            .events
            .contains(AppLayerEventKind::WrongDirectionFirstData));
        assert!(flow.flags.no_applayer_inspection);
        let ssn = flow.protoctx.as_ref().unwrap();
        assert!(ssn.client.detection_completed());
        assert!(ssn.server.detection_completed());
        assert_eq!(flow.session_first_seen(), DataFirstSeen::Committed);
        assert!(flow.alstate.is_none());
    }

    #[test]
    fn test_mismatch_prior_decision_wins() {
        let engine = engine();
        let mut ctx = tctx(&engine);
        let http = ctx.proto_by_name("http");
        let mut ra = MockReassembler::default();
        let mut pkt = tcp_packet(Direction::ToClient);
        let mut flow = tcp_flow();
        note_seen(&mut flow, Direction::ToServer);

        ctx.handle_tcp_data(
            &mut ra,
            &mut pkt,
            &mut flow,
            HTTP_REQUEST,
            StreamFlags::start(Direction::ToServer),
        )
        .unwrap();

        // the server now greets like an SMTP server; data already went
        // to the http parser, so http stays committed
        note_seen(&mut flow, Direction::ToClient);
        ctx.handle_tcp_data(
            &mut ra,
            &mut pkt,
            &mut flow,
            b"220 mail.example.com ESMTP\r\n",
            StreamFlags::start(Direction::ToClient),
        )
        .unwrap();

        assert!(flow
            .events
            .contains(AppLayerEventKind::MismatchProtocolBothDirections));
        assert_eq!(flow.alproto, http);
        assert_eq!(flow.alproto_ts, http);
        assert_eq!(flow.alproto_tc, http);
        assert!(!flow.flags.no_applayer_inspection);
    }

    #[test]
    fn test_detect_protocol_only_one_direction() {
        let engine = engine();
        let mut ctx = tctx(&engine);
        let echo = ctx.proto_by_name("echo");
        let mut ra = MockReassembler::default();
        let mut pkt = tcp_packet(Direction::ToClient);
        let mut flow = tcp_flow();
        let garbage = b"XQJWZKVYPLTRNMBD";

        // to-server bytes never match anything; both families exhaust
        note_seen(&mut flow, Direction::ToServer);
        ctx.handle_tcp_data(
            &mut ra,
            &mut pkt,
            &mut flow,
            garbage,
            StreamFlags::start(Direction::ToServer),
        )
        .unwrap();
        assert!(flow.flags.is_pm_done(Direction::ToServer));
        assert!(flow.flags.is_pp_done(Direction::ToServer));
        assert_eq!(flow.alproto, AppProto::UNKNOWN);

        // to-client identifies as echo
        note_seen(&mut flow, Direction::ToClient);
        ctx.handle_tcp_data(
            &mut ra,
            &mut pkt,
            &mut flow,
            b"ECHO hello\r\n",
            StreamFlags::start(Direction::ToClient),
        )
        .unwrap();
        assert_eq!(flow.alproto, echo);

        // the re-presented to-server prefix inherits the echo parser
        // and the one-direction event fires
        ctx.handle_tcp_data(
            &mut ra,
            &mut pkt,
            &mut flow,
            garbage,
            StreamFlags::start(Direction::ToServer),
        )
        .unwrap();

        assert!(flow
            .events
            .contains(AppLayerEventKind::DetectProtocolOnlyOneDirection));
        assert!(flow
            .protoctx
            .as_ref()
            .unwrap()
            .client
            .detection_completed());
        assert_eq!(flow.data_al_so_far[Direction::ToServer.index()], 0);
        assert_eq!(sink(&flow).total(Direction::ToServer), garbage.len() as u64);
    }

    #[test]
    fn test_udp_dns_detects_once_then_parses() {
        let engine = engine();
        let mut ctx: AppLayerThreadCtx<NoopProfiler> = engine.get_ctx_thread().unwrap();
        let dns = ctx.proto_by_name("dns");
        let flow = udp_flow();

        let pkt = udp_packet(Direction::ToServer, &DNS_QUERY);
        ctx.handle_udp(&pkt, &flow).unwrap();

        {
            let guard = flow.lock();
            assert_eq!(guard.alproto, dns);
            assert!(guard.flags.alproto_detect_done);
            assert_eq!(
                sink(&guard).total(Direction::ToServer),
                DNS_QUERY.len() as u64
            );
        }
        assert_eq!(ctx.detect_calls(), 1);
        assert_eq!(ctx.parse_calls(), 1);

        // second datagram goes straight to the parser
        let pkt = udp_packet(Direction::ToClient, &DNS_QUERY);
        ctx.handle_udp(&pkt, &flow).unwrap();
        assert_eq!(ctx.detect_calls(), 1);
        assert_eq!(ctx.parse_calls(), 2);
    }

    #[test]
    fn test_udp_unknown_detects_only_once() {
        let engine = engine();
        let mut ctx = tctx(&engine);
        let flow = udp_flow();

        // garbage datagram: detection runs, fails, and is never retried
        let pkt = udp_packet(Direction::ToServer, b"\x00");
        ctx.handle_udp(&pkt, &flow).unwrap();
        assert_eq!(ctx.detect_calls(), 1);
        assert!(flow.lock().flags.alproto_detect_done);

        let pkt = udp_packet(Direction::ToServer, b"\x00");
        ctx.handle_udp(&pkt, &flow).unwrap();
        assert_eq!(ctx.detect_calls(), 1);
        assert_eq!(ctx.parse_calls(), 0);
    }

    // --- cross-direction orchestration ---

    #[test]
    fn test_force_drain_of_opposing_direction() {
        let engine = engine();
        let mut ctx = tctx(&engine);
        let http = ctx.proto_by_name("http");
        // the request was reassembled but not yet delivered; the
        // response reaches the app layer first
        let mut ra = MockReassembler::with_pending(Direction::ToServer, HTTP_REQUEST);
        let mut pkt = tcp_packet(Direction::ToClient);
        let mut flow = tcp_flow();
        note_seen(&mut flow, Direction::ToServer);

        ctx.handle_tcp_data(
            &mut ra,
            &mut pkt,
            &mut flow,
            HTTP_RESPONSE,
            StreamFlags::start(Direction::ToClient),
        )
        .unwrap();

        // the drain was asked for the to-server stream, with the packet
        // retagged to the ACK direction for the nested call
        assert_eq!(ra.calls, vec![(Direction::ToServer, Direction::ToClient)]);
        // and the original direction came back
        assert_eq!(pkt.direction(), Direction::ToClient);

        assert_eq!(flow.alproto, http);
        let state = sink(&flow);
        assert_eq!(state.buffered(Direction::ToServer), HTTP_REQUEST);
        assert_eq!(state.buffered(Direction::ToClient), HTTP_RESPONSE);
        let ssn = flow.protoctx.as_ref().unwrap();
        assert!(ssn.client.detection_completed());
        assert!(ssn.server.detection_completed());
        assert!(flow.events.is_empty());
    }

    #[test]
    fn test_drain_failure_is_fatal_to_flow() {
        let engine = engine();
        let mut ctx = tctx(&engine);
        let mut ra = MockReassembler::failing();
        let mut pkt = tcp_packet(Direction::ToClient);
        let mut flow = tcp_flow();
        note_seen(&mut flow, Direction::ToServer);

        let err = ctx
            .handle_tcp_data(
                &mut ra,
                &mut pkt,
                &mut flow,
                HTTP_RESPONSE,
                StreamFlags::start(Direction::ToClient),
            )
            .unwrap_err();

        assert!(matches!(err, AppLayerError::OpposingDrain(_)));
        assert!(flow.flags.no_applayer_inspection);
        let ssn = flow.protoctx.as_ref().unwrap();
        assert!(ssn.client.detection_completed());
        assert!(ssn.server.detection_completed());
        // direction restored despite the error
        assert_eq!(pkt.direction(), Direction::ToClient);
    }

    #[test]
    fn test_rollback_when_preferred_direction_still_pending() {
        let engine = engine();
        let mut ctx = tctx(&engine);
        let http = ctx.proto_by_name("http");
        let mut ra = MockReassembler::default();
        let mut pkt = tcp_packet(Direction::ToServer);
        let mut flow = tcp_flow();
        // both sides have produced data, but the response is what
        // reaches the app layer first
        note_seen(&mut flow, Direction::ToServer);
        note_seen(&mut flow, Direction::ToClient);

        let err = ctx
            .handle_tcp_data(
                &mut ra,
                &mut pkt,
                &mut flow,
                HTTP_RESPONSE,
                StreamFlags::start(Direction::ToClient),
            )
            .unwrap_err();
        assert!(matches!(err, AppLayerError::DetectionDeferred));

        // everything rolled back: the decision can be re-made
        assert_eq!(flow.alproto, AppProto::UNKNOWN);
        assert_eq!(flow.alproto_tc, AppProto::UNKNOWN);
        assert!(!flow
            .protoctx
            .as_ref()
            .unwrap()
            .server
            .detection_completed());
        assert!(!flow.flags.is_pm_done(Direction::ToClient));
        assert!(!flow.flags.is_pp_done(Direction::ToClient));
        assert!(flow.alstate.is_none());
        assert!(!flow.flags.no_applayer_inspection);
        assert!(flow.events.is_empty());

        // the request side arrives, detection commits, and the
        // re-presented response is accepted
        ctx.handle_tcp_data(
            &mut ra,
            &mut pkt,
            &mut flow,
            HTTP_REQUEST,
            StreamFlags::start(Direction::ToServer),
        )
        .unwrap();
        ctx.handle_tcp_data(
            &mut ra,
            &mut pkt,
            &mut flow,
            HTTP_RESPONSE,
            StreamFlags::start(Direction::ToClient),
        )
        .unwrap();

        assert_eq!(flow.alproto, http);
        let state = sink(&flow);
        assert_eq!(state.buffered(Direction::ToServer), HTTP_REQUEST);
        assert_eq!(state.buffered(Direction::ToClient), HTTP_RESPONSE);
    }

    #[test]
    fn test_inherited_protocol_refuses_direction() {
        let engine = engine();
        let mut ctx = tctx(&engine);
        let http = ctx.proto_by_name("http");
        let mut ra = MockReassembler::default();
        let mut pkt = tcp_packet(Direction::ToClient);
        let mut flow = tcp_flow();
        // opposing side carries a decided protocol whose parser wants
        // to-server data first, while nothing has been parsed yet
        flow.alproto_ts = http;
        note_seen(&mut flow, Direction::ToClient);

        let err = ctx
            .handle_tcp_data(
                &mut ra,
                &mut pkt,
                &mut flow,
                b"garbage that matches nothing",
                StreamFlags::start(Direction::ToClient),
            )
            .unwrap_err();

        assert!(matches!(err, AppLayerError::DirectionNotAccepted { .. }));
        assert!(flow.flags.no_applayer_inspection);
        // refusal is silent: no event for this shape
        assert!(flow.events.is_empty());
    }

    #[test]
    fn test_deferred_bytes_are_not_refed_twice() {
        let engine = engine();
        let mut ctx = tctx(&engine);
        let echo = ctx.proto_by_name("echo");
        let mut ra = MockReassembler::default();
        let mut pkt = tcp_packet(Direction::ToClient);
        let mut flow = tcp_flow();

        // to-client commits echo
        note_seen(&mut flow, Direction::ToClient);
        ctx.handle_tcp_data(
            &mut ra,
            &mut pkt,
            &mut flow,
            b"ECHO hi\r\n",
            StreamFlags::start(Direction::ToClient),
        )
        .unwrap();
        assert_eq!(flow.alproto, echo);

        // short to-server chunk: detection undecided (below the pattern
        // window), bytes are fed to the echo parser and parked
        note_seen(&mut flow, Direction::ToServer);
        ctx.handle_tcp_data(
            &mut ra,
            &mut pkt,
            &mut flow,
            b"hi",
            StreamFlags::start(Direction::ToServer),
        )
        .unwrap();
        assert_eq!(flow.data_al_so_far[Direction::ToServer.index()], 2);
        assert_eq!(sink(&flow).total(Direction::ToServer), 2);

        // the reassembler re-presents the grown prefix; only the new
        // tail reaches the parser
        ctx.handle_tcp_data(
            &mut ra,
            &mut pkt,
            &mut flow,
            b"hi there, long enough now",
            StreamFlags::start(Direction::ToServer),
        )
        .unwrap();
        assert_eq!(sink(&flow).total(Direction::ToServer), 25);
        assert!(flow
            .events
            .contains(AppLayerEventKind::DetectProtocolOnlyOneDirection));
        assert_eq!(flow.data_al_so_far[Direction::ToServer.index()], 0);
    }

    #[test]
    fn test_detection_exhausted_gives_up() {
        let engine = engine();
        let mut ctx = tctx(&engine);
        let mut ra = MockReassembler::default();
        let mut pkt = tcp_packet(Direction::ToClient);
        let mut flow = tcp_flow();
        let garbage = b"XQJWZKVYPLTRNMBD";

        note_seen(&mut flow, Direction::ToServer);
        ctx.handle_tcp_data(
            &mut ra,
            &mut pkt,
            &mut flow,
            garbage,
            StreamFlags::start(Direction::ToServer),
        )
        .unwrap();
        assert!(!flow.flags.no_applayer_inspection);

        note_seen(&mut flow, Direction::ToClient);
        ctx.handle_tcp_data(
            &mut ra,
            &mut pkt,
            &mut flow,
            garbage,
            StreamFlags::start(Direction::ToClient),
        )
        .unwrap();

        assert!(flow.flags.no_applayer_inspection);
        let ssn = flow.protoctx.as_ref().unwrap();
        assert!(ssn.client.detection_completed());
        assert!(ssn.server.detection_completed());
        assert_eq!(flow.session_first_seen(), DataFirstSeen::Committed);
        assert!(flow.alstate.is_none());
    }

    // --- invariants ---

    #[test]
    fn test_no_inspection_short_circuits_everything() {
        let engine = engine();
        let mut ctx = tctx(&engine);
        let mut ra = MockReassembler::default();
        let mut pkt = tcp_packet(Direction::ToServer);
        let mut flow = tcp_flow();
        flow.set_no_applayer_inspection();

        ctx.handle_tcp_data(
            &mut ra,
            &mut pkt,
            &mut flow,
            HTTP_REQUEST,
            StreamFlags::start(Direction::ToServer),
        )
        .unwrap();

        assert_eq!(flow.alproto, AppProto::UNKNOWN);
        assert_eq!(ctx.detect_calls(), 0);
        assert_eq!(ctx.parse_calls(), 0);

        // same on the udp path
        let shared = udp_flow();
        shared.lock().set_no_applayer_inspection();
        let dgram = udp_packet(Direction::ToServer, &DNS_QUERY);
        ctx.handle_udp(&dgram, &shared).unwrap();
        assert_eq!(ctx.detect_calls(), 0);
    }

    #[test]
    fn test_committed_protocol_skips_detection() {
        let engine = engine();
        let mut ctx = tctx(&engine);
        let mut ra = MockReassembler::default();
        let mut pkt = tcp_packet(Direction::ToServer);
        let mut flow = tcp_flow();
        note_seen(&mut flow, Direction::ToServer);

        ctx.handle_tcp_data(
            &mut ra,
            &mut pkt,
            &mut flow,
            HTTP_REQUEST,
            StreamFlags::start(Direction::ToServer),
        )
        .unwrap();
        assert_eq!(ctx.detect_calls(), 1);

        ctx.handle_tcp_data(
            &mut ra,
            &mut pkt,
            &mut flow,
            b"more body bytes",
            StreamFlags::data(Direction::ToServer),
        )
        .unwrap();

        assert_eq!(ctx.detect_calls(), 1);
        assert_eq!(
            sink(&flow).total(Direction::ToServer),
            (HTTP_REQUEST.len() + 15) as u64
        );
    }

    #[test]
    fn test_mid_stream_data_without_protocol_is_dropped() {
        let engine = engine();
        let mut ctx = tctx(&engine);
        let mut ra = MockReassembler::default();
        let mut pkt = tcp_packet(Direction::ToServer);
        let mut flow = tcp_flow();

        ctx.handle_tcp_data(
            &mut ra,
            &mut pkt,
            &mut flow,
            b"who knows what this is",
            StreamFlags::data(Direction::ToServer),
        )
        .unwrap();

        assert_eq!(ctx.parse_calls(), 0);
        assert!(flow.alstate.is_none());
    }

    #[test]
    fn test_first_seen_dir_is_monotonic() {
        let mut ssn = TcpSession::new();
        assert_eq!(ssn.data_first_seen_dir, DataFirstSeen::None);
        ssn.note_data_seen(Direction::ToClient);
        assert_eq!(
            ssn.data_first_seen_dir,
            DataFirstSeen::Dir(Direction::ToClient)
        );
        ssn.note_data_seen(Direction::ToServer);
        assert_eq!(ssn.data_first_seen_dir, DataFirstSeen::Both);
        // only the dispatcher moves it to committed, and never back
        ssn.data_first_seen_dir = DataFirstSeen::Committed;
        ssn.note_data_seen(Direction::ToClient);
        assert_eq!(ssn.data_first_seen_dir, DataFirstSeen::Committed);
    }

    // --- stream-message intake ---

    #[test]
    fn test_stream_msg_enqueued_on_session() {
        let flow: SharedFlow = Arc::new(Mutex::new(tcp_flow()));
        let msg = StreamMsg::new(
            Some(Arc::clone(&flow)),
            Direction::ToServer,
            1000,
            b"raw bytes".to_vec(),
        );

        handle_tcp_stream_msg(msg).unwrap();

        let mut guard = flow.lock();
        let ssn = guard.protoctx.as_mut().unwrap();
        assert_eq!(ssn.stream_msg_len(Direction::ToServer), 1);
        assert_eq!(ssn.stream_msg_len(Direction::ToClient), 0);
        let queued = ssn.pop_stream_msg(Direction::ToServer).unwrap();
        assert_eq!(queued.data, b"raw bytes");
        // the back-reference was cleared before queueing
        assert!(queued.flow.is_none());
    }

    #[test]
    fn test_stream_msg_without_session_is_released() {
        let flow: SharedFlow = Arc::new(Mutex::new(Flow::new(
            IpProtocol::Tcp,
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, 100)),
            49152,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            80,
        )));
        let msg = StreamMsg::new(
            Some(Arc::clone(&flow)),
            Direction::ToClient,
            0,
            vec![1, 2, 3],
        );

        handle_tcp_stream_msg(msg).unwrap();
        // nothing queued anywhere; only our handle keeps the flow alive
        assert_eq!(Arc::strong_count(&flow), 1);
    }

    // --- engine plumbing ---

    #[test]
    fn test_proto_name_round_trip() {
        let engine = engine();
        let ctx = tctx(&engine);
        let http = engine.proto_by_name("http");
        assert_ne!(http, AppProto::UNKNOWN);
        assert_eq!(engine.proto_to_string(http), "http");
        assert_eq!(ctx.proto_by_name("http"), http);
        assert_eq!(ctx.proto_to_string(AppProto::UNKNOWN), "unknown");
        assert_eq!(engine.proto_by_name("gopher"), AppProto::UNKNOWN);
    }

    #[test]
    fn test_disabled_engine_ignores_data() {
        let engine = AppLayer::setup(AppLayerConfig {
            enabled: false,
            ..AppLayerConfig::default()
        })
        .unwrap();
        let mut ctx: AppLayerThreadCtx<NoopProfiler> = engine.get_ctx_thread().unwrap();
        let mut ra = MockReassembler::default();
        let mut pkt = tcp_packet(Direction::ToServer);
        let mut flow = tcp_flow();

        ctx.handle_tcp_data(
            &mut ra,
            &mut pkt,
            &mut flow,
            HTTP_REQUEST,
            StreamFlags::start(Direction::ToServer),
        )
        .unwrap();
        assert_eq!(ctx.detect_calls(), 0);
        assert_eq!(flow.alproto, AppProto::UNKNOWN);
    }

    #[test]
    fn test_profiled_dispatch_records_windows() {
        let engine = engine();
        let mut ctx: AppLayerThreadCtx<HistProfiler> = engine.get_ctx_thread().unwrap();
        let flow = udp_flow();

        let pkt = udp_packet(Direction::ToServer, &DNS_QUERY);
        ctx.handle_udp(&pkt, &flow).unwrap();

        let snap = ctx.profiler().snapshot();
        assert_eq!(snap.detect_count, 1);
        assert_eq!(snap.parse_count, 1);
        assert_eq!(snap.packets, 1);
        assert_eq!(snap.per_proto.len(), 1);
    }
}
