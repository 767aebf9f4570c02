//! Error kinds the game core distinguishes.
//!
//! Non-fatal kinds (`InsufficientResources`, `InvalidTarget`, `Blocked`) are
//! turned into `print_msg` responses and leave state unchanged. Fatal kinds
//! abort game setup or mark a player as gone.

use crate::game::resources::ResourceKind;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GameError {
    /// The audio decoder could not open or decode the source file.
    #[error("audio analysis failed: {0}")]
    AnalyzeFailed(String),

    /// Graph reduction left the nucleus positions disconnected.
    #[error("no way between the given endpoints")]
    UnreachableEndpoints,

    /// Map generation failed after all retries.
    #[error("map is unplayable for this audio source")]
    UnplayableMap,

    /// A charge was rejected; `missing` lists the resources lacking funds.
    #[error("insufficient resources: {missing:?}")]
    InsufficientResources { missing: Vec<ResourceKind> },

    /// A command referenced a non-existent or non-owned entity.
    #[error("invalid target")]
    InvalidTarget,

    /// A command was applied to a blocked neuron.
    #[error("neuron is blocked")]
    Blocked,

    /// Malformed or incomplete wire message.
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// Outbound send failed; the player counts as resigned.
    #[error("client disconnected")]
    DisconnectedClient,
}
