//! L7 parser seam
//!
//! The dispatcher never parses protocols itself; it routes payload to a
//! per-flow parser state created from the registry's factory the first
//! time bytes arrive for a committed protocol. Real protocol parsers
//! implement [`L7Parser`]; the built-in [`SinkParser`] only accounts for
//! and buffers the bytes.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use super::{AppProto, FirstDataDir};
use crate::core::{Direction, Flow, IpProtocol};

/// Parser-side failures
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("no parser registered for {alproto} over {ipproto}")]
    NoParser {
        ipproto: IpProtocol,
        alproto: AppProto,
    },
    #[error("malformed payload: {0}")]
    Malformed(String),
}

/// Per-flow parser state
pub trait L7Parser: Send {
    /// Consume in-order payload for one direction
    fn parse(&mut self, dir: Direction, data: &[u8]) -> Result<(), ParseError>;

    /// Downcast hook for engines that need the concrete state
    fn as_any(&self) -> &dyn Any;
}

/// One registered parser
pub struct ParserEntry {
    /// Registry name, e.g. "http"
    pub name: &'static str,
    /// Transport the parser runs over
    pub ipproto: IpProtocol,
    /// Protocol id the parser claims
    pub alproto: AppProto,
    /// Direction the parser insists on seeing payload from first
    pub first_data_dir: FirstDataDir,
    /// Factory for the per-flow state
    pub make_state: fn() -> Box<dyn L7Parser>,
}

/// Table of registered parsers keyed by (transport, protocol id)
pub struct ParserRegistry {
    by_key: HashMap<(IpProtocol, AppProto), ParserEntry>,
}

impl ParserRegistry {
    pub fn new() -> Self {
        Self {
            by_key: HashMap::new(),
        }
    }

    /// Register a parser; later registrations for the same key win
    pub fn register(&mut self, entry: ParserEntry) {
        self.by_key.insert((entry.ipproto, entry.alproto), entry);
    }

    /// Direction policy of a parser; unconstrained when nothing is
    /// registered
    pub fn first_data_dir(&self, ipproto: IpProtocol, alproto: AppProto) -> FirstDataDir {
        self.by_key
            .get(&(ipproto, alproto))
            .map(|e| e.first_data_dir)
            .unwrap_or(FirstDataDir::Any)
    }

    /// Build a fresh per-flow state for a protocol
    pub fn new_state(
        &self,
        ipproto: IpProtocol,
        alproto: AppProto,
    ) -> Result<Box<dyn L7Parser>, ParseError> {
        let entry = self
            .by_key
            .get(&(ipproto, alproto))
            .ok_or(ParseError::NoParser { ipproto, alproto })?;
        Ok((entry.make_state)())
    }

    /// Number of registered parsers
    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    /// Create a per-worker parser context
    pub fn get_ctx_thread(self: &Arc<Self>) -> ParserThreadCtx {
        ParserThreadCtx {
            registry: Arc::clone(self),
            parse_calls: 0,
        }
    }
}

impl Default for ParserRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-worker parser context
pub struct ParserThreadCtx {
    registry: Arc<ParserRegistry>,
    parse_calls: u64,
}

impl ParserThreadCtx {
    /// Direction policy of a parser
    pub fn first_data_dir(&self, ipproto: IpProtocol, alproto: AppProto) -> FirstDataDir {
        self.registry.first_data_dir(ipproto, alproto)
    }

    /// Total parse invocations on this worker
    pub fn parse_calls(&self) -> u64 {
        self.parse_calls
    }

    /// Feed payload to the flow's parser state, creating it on first use.
    ///
    /// Callers guarantee `alproto` is a committed, known protocol.
    pub fn parse(
        &mut self,
        flow: &mut Flow,
        alproto: AppProto,
        dir: Direction,
        data: &[u8],
    ) -> Result<(), ParseError> {
        debug_assert!(!alproto.is_unknown(), "parse called without a protocol");
        if flow.alstate.is_none() {
            flow.alstate = Some(self.registry.new_state(flow.proto, alproto)?);
        }
        self.parse_calls += 1;
        debug!(%alproto, %dir, len = data.len(), "feeding parser");
        flow.alstate
            .as_mut()
            .ok_or(ParseError::NoParser {
                ipproto: flow.proto,
                alproto,
            })?
            .parse(dir, data)
    }

    /// Drop a flow's parser state
    pub fn cleanup_flow(&self, flow: &mut Flow) {
        flow.alstate = None;
    }
}

/// Cap on buffered bytes per direction in the sink parser
pub const SINK_BUFFER_LIMIT: usize = 1024 * 1024;

/// Default parser state: buffers payload per direction up to a cap and
/// keeps exact byte totals beyond it
#[derive(Debug)]
pub struct SinkParser {
    buf: [Vec<u8>; 2],
    total: [u64; 2],
    limit: usize,
}

impl SinkParser {
    pub fn new() -> Self {
        Self::with_limit(SINK_BUFFER_LIMIT)
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            buf: [Vec::new(), Vec::new()],
            total: [0, 0],
            limit,
        }
    }

    /// Bytes buffered for a direction
    pub fn buffered(&self, dir: Direction) -> &[u8] {
        &self.buf[dir.index()]
    }

    /// Total bytes seen for a direction, buffered or not
    pub fn total(&self, dir: Direction) -> u64 {
        self.total[dir.index()]
    }
}

impl Default for SinkParser {
    fn default() -> Self {
        Self::new()
    }
}

impl L7Parser for SinkParser {
    fn parse(&mut self, dir: Direction, data: &[u8]) -> Result<(), ParseError> {
        let idx = dir.index();
        self.total[idx] += data.len() as u64;
        let room = self.limit.saturating_sub(self.buf[idx].len());
        self.buf[idx].extend_from_slice(&data[..data.len().min(room)]);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Factory used by registrations that only need byte accounting
pub fn sink_state() -> Box<dyn L7Parser> {
    Box::new(SinkParser::new())
}
