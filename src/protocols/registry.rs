//! Protocol-detection registry
//!
//! Two detector families run against the initial payload of each
//! direction: the pattern matcher (PM), an aho-corasick automaton over
//! registered fingerprints, and the probing parsers (PP), per-protocol
//! validator functions tried in default-port order. Each family latches a
//! per-direction "done" flag on the flow once it has exhausted its
//! chances, which is what the dispatcher's give-up logic keys off.

use std::collections::HashMap;
use std::sync::Arc;

use aho_corasick::AhoCorasick;
use thiserror::Error;
use tracing::debug;

use super::{AppProto, ProbeVerdict, ProtocolDef};
use crate::core::{Direction, Flow, IpProtocol};

/// Registry construction and thread-context errors
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("protocol {0} already registered")]
    DuplicateProtocol(&'static str),
    #[error("detection registry used before prepare()")]
    NotPrepared,
    #[error("pattern compilation failed: {0}")]
    PatternCompile(#[from] aho_corasick::BuildError),
    #[error("protocol id space exhausted")]
    TooManyProtocols,
}

/// Per-pattern bookkeeping for a compiled automaton
#[derive(Debug, Clone)]
struct PatternMeta {
    alproto: AppProto,
    offset: usize,
    depth: usize,
}

/// Compiled patterns for one (transport, direction) pair
struct PatternSet {
    ac: AhoCorasick,
    meta: Vec<PatternMeta>,
    max_depth: usize,
}

/// Aggregate outcome of the probe family for one call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProbeOutcome {
    Match(AppProto),
    Exhausted,
    Incomplete,
}

/// Registry of protocol fingerprints and probes
pub struct DetectRegistry {
    defs: Vec<ProtocolDef>,
    by_name: HashMap<&'static str, AppProto>,
    matchers: HashMap<(IpProtocol, Direction), PatternSet>,
    prepared: bool,
}

impl DetectRegistry {
    pub fn new() -> Self {
        Self {
            defs: Vec::new(),
            by_name: HashMap::new(),
            matchers: HashMap::new(),
            prepared: false,
        }
    }

    /// Register a protocol and allocate its id.
    ///
    /// Ids start at 1; 0 stays the UNKNOWN sentinel.
    pub fn register(&mut self, def: ProtocolDef) -> Result<AppProto, SetupError> {
        if self.by_name.contains_key(def.name) {
            return Err(SetupError::DuplicateProtocol(def.name));
        }
        let id = u16::try_from(self.defs.len() + 1).map_err(|_| SetupError::TooManyProtocols)?;
        let alproto = AppProto(id);
        self.by_name.insert(def.name, alproto);
        self.defs.push(def);
        self.prepared = false;
        Ok(alproto)
    }

    /// Compile the pattern automatons. Must run after the last
    /// registration and before any thread context is created.
    pub fn prepare(&mut self) -> Result<(), SetupError> {
        self.matchers.clear();

        let mut groups: HashMap<(IpProtocol, Direction), (Vec<&'static [u8]>, Vec<PatternMeta>)> =
            HashMap::new();
        for (idx, def) in self.defs.iter().enumerate() {
            let alproto = AppProto((idx + 1) as u16);
            for dir in [Direction::ToServer, Direction::ToClient] {
                for pat in def.patterns(dir) {
                    let entry = groups.entry((def.ipproto, dir)).or_default();
                    entry.0.push(pat.bytes);
                    entry.1.push(PatternMeta {
                        alproto,
                        offset: pat.offset,
                        depth: pat.depth,
                    });
                }
            }
        }

        for ((ipproto, dir), (patterns, meta)) in groups {
            let ac = AhoCorasick::builder()
                .ascii_case_insensitive(true)
                .build(&patterns)?;
            let max_depth = meta.iter().map(|m| m.depth).max().unwrap_or(0);
            self.matchers.insert(
                (ipproto, dir),
                PatternSet {
                    ac,
                    meta,
                    max_depth,
                },
            );
        }

        self.prepared = true;
        Ok(())
    }

    /// Create a per-worker detection context
    pub fn get_ctx_thread(self: &Arc<Self>) -> Result<DetectThreadCtx, SetupError> {
        if !self.prepared {
            return Err(SetupError::NotPrepared);
        }
        Ok(DetectThreadCtx {
            registry: Arc::clone(self),
            detect_calls: 0,
        })
    }

    /// Look up a protocol id by registry name
    pub fn proto_by_name(&self, name: &str) -> AppProto {
        self.by_name.get(name).copied().unwrap_or(AppProto::UNKNOWN)
    }

    /// Registry name of a protocol id
    pub fn proto_to_string(&self, alproto: AppProto) -> &'static str {
        self.def(alproto).map(|d| d.name).unwrap_or("unknown")
    }

    /// Registration record for an id
    pub fn def(&self, alproto: AppProto) -> Option<&ProtocolDef> {
        if alproto.is_unknown() {
            return None;
        }
        self.defs.get(alproto.0 as usize - 1)
    }

    /// Number of registered protocols
    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    /// Longest prefix window any pattern for this (transport, direction)
    /// needs; once that much payload has been inspected without a match
    /// the PM family is done for the direction
    fn max_pattern_depth(&self, ipproto: IpProtocol, dir: Direction) -> usize {
        self.matchers
            .get(&(ipproto, dir))
            .map(|s| s.max_depth)
            .unwrap_or(0)
    }

    /// Run the pattern family over a payload prefix
    fn pattern_match(&self, ipproto: IpProtocol, dir: Direction, data: &[u8]) -> Option<AppProto> {
        let set = self.matchers.get(&(ipproto, dir))?;
        let window = &data[..data.len().min(set.max_depth)];

        let mut best: Option<(usize, AppProto)> = None;
        for m in set.ac.find_overlapping_iter(window) {
            let meta = &set.meta[m.pattern().as_usize()];
            if m.start() < meta.offset || m.end() > meta.depth {
                continue;
            }
            let len = m.end() - m.start();
            if best.map_or(true, |(best_len, _)| len > best_len) {
                best = Some((len, meta.alproto));
            }
        }
        best.map(|(_, alproto)| alproto)
    }

    /// Run the probe family; default-port candidates go first
    fn probe(
        &self,
        flow: &Flow,
        ipproto: IpProtocol,
        dir: Direction,
        data: &[u8],
    ) -> ProbeOutcome {
        let mut incomplete = false;
        let mut tried_any = false;

        let candidates = |port_pass: bool| {
            self.defs.iter().enumerate().filter_map(move |(idx, def)| {
                let probe = def.probe(dir)?;
                let wanted = def.ipproto == ipproto
                    && (def.default_port == Some(flow.dst_port)) == port_pass;
                wanted.then_some((idx, probe))
            })
        };

        for (idx, probe) in candidates(true).chain(candidates(false)) {
            tried_any = true;
            match probe(data) {
                ProbeVerdict::Match => return ProbeOutcome::Match(AppProto((idx + 1) as u16)),
                ProbeVerdict::Incomplete => incomplete = true,
                ProbeVerdict::Failed => {}
            }
        }

        if !tried_any || !incomplete {
            ProbeOutcome::Exhausted
        } else {
            ProbeOutcome::Incomplete
        }
    }
}

impl Default for DetectRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-worker detection context
pub struct DetectThreadCtx {
    registry: Arc<DetectRegistry>,
    detect_calls: u64,
}

impl DetectThreadCtx {
    /// The registry this context detects against
    pub fn registry(&self) -> &DetectRegistry {
        &self.registry
    }

    /// Total detection attempts made on this worker
    pub fn detect_calls(&self) -> u64 {
        self.detect_calls
    }

    /// Identify the protocol carried by an initial payload prefix.
    ///
    /// Runs the pattern family, then the probes. Latches the flow's
    /// per-direction PM/PP exhaustion flags as families run out of
    /// chances; returns [`AppProto::UNKNOWN`] when no decision was
    /// reached.
    pub fn detect(
        &mut self,
        flow: &mut Flow,
        data: &[u8],
        ipproto: IpProtocol,
        dir: Direction,
    ) -> AppProto {
        self.detect_calls += 1;

        if !flow.flags.is_pm_done(dir) {
            if let Some(alproto) = self.registry.pattern_match(ipproto, dir, data) {
                debug!(%alproto, %dir, "pattern match");
                return alproto;
            }
            if data.len() >= self.registry.max_pattern_depth(ipproto, dir) {
                flow.flags.set_pm_done(dir);
            }
        }

        if !flow.flags.is_pp_done(dir) {
            match self.registry.probe(flow, ipproto, dir, data) {
                ProbeOutcome::Match(alproto) => {
                    debug!(%alproto, %dir, "probe match");
                    return alproto;
                }
                ProbeOutcome::Exhausted => flow.flags.set_pp_done(dir),
                ProbeOutcome::Incomplete => {}
            }
        }

        AppProto::UNKNOWN
    }
}
