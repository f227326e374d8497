//! Dispatch-core error types

use thiserror::Error;

use crate::protocols::parser::ParseError;
use crate::protocols::AppProto;
use crate::stream::ReassemblyError;

/// Failures surfaced by the app-layer dispatcher.
///
/// None of these are fatal to the process. `DetectionDeferred` is the
/// one soft error: the caller may re-present the same bytes later. The
/// others leave the flow marked as not inspectable.
#[derive(Debug, Error)]
pub enum AppLayerError {
    #[error("draining the opposing stream failed: {0}")]
    OpposingDrain(#[from] ReassemblyError),

    #[error("first data arrived in the wrong direction for {proto}")]
    WrongDirectionFirstData { proto: AppProto },

    #[error("protocol decision rolled back until preferred-direction data arrives")]
    DetectionDeferred,

    #[error("{proto} does not accept first data from this direction")]
    DirectionNotAccepted { proto: AppProto },

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("stream message carries no flow reference")]
    MissingFlow,
}

pub type Result<T> = std::result::Result<T, AppLayerError>;
