//! Dialog fragment value type

use serde::{Deserialize, Serialize};

/// One synthesis unit within a dialog turn.
///
/// Produced by the fragmenter, consumed by the facade. Immutable once
/// emitted; the trailing pause belongs to the fragment, not the gap
/// between stream chunks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragment {
    /// Text to synthesize
    pub text: String,
    /// Pause to insert after this fragment's audio, in milliseconds
    pub pause_after_ms: u64,
    /// First fragment of the turn (the latency-optimised one)
    pub is_first: bool,
    /// Last fragment of the turn
    pub is_last: bool,
    /// Turn this fragment belongs to
    pub turn_id: String,
    /// Position within the turn, starting at 0
    pub index: usize,
}
