//! The shared step-driver state set
//!
//! Every long-running operation in the stack (an SDO transfer, a liveness
//! configuration sequence, a PDO configuration pass, an NMT request) is a
//! re-entrant step driver: the caller invokes it once per poll until a
//! terminal state comes back. `CommState` is the common vocabulary those
//! drivers speak.

/// Progress of a re-entrant communication operation
///
/// `Done`, `Error`, and `Timeout` are terminal and latched; the caller
/// observes them and clears the operation with its reset call before
/// starting the next one.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CommState {
    /// No operation in progress
    Idle,
    /// A request is on the wire, awaiting the response
    Waiting,
    /// The transmit resource was busy; the next invocation retries
    Retry,
    /// The operation spans multiple steps and is still progressing
    Busy,
    /// The operation completed
    Done,
    /// The operation failed: protocol abort, malformed response, or retries exhausted
    Error,
    /// No response arrived within the timeout window, retries exhausted
    Timeout,
}

impl CommState {
    /// True for the latched terminal states
    pub fn is_terminal(&self) -> bool {
        matches!(self, CommState::Done | CommState::Error | CommState::Timeout)
    }
}
