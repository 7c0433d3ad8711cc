//! Error taxonomy
//!
//! Transfer-level failures are recovered per endpoint and surface only
//! through the retired request's [`TransferStatus`]. Protocol failures
//! stall endpoint 0 and never leave it. Resource exhaustion fails the
//! request being built. Hardware handshake timeouts are the one class
//! the controller owner must see, since the recommended recovery is a
//! full controller reset.

/// Engine operation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The transfer descriptor arena is exhausted.
    ///
    /// Fails only the request being built; the endpoint and the rest of
    /// the controller are unaffected.
    OutOfMemory,
    /// The endpoint address names no usable endpoint.
    InvalidEndpoint,
    /// The endpoint exists but hasn't been enabled.
    EndpointDisabled,
    /// The per-endpoint request FIFO is full.
    QueueFull,
    /// The operation doesn't apply to the current bus or control state.
    InvalidState,
    /// A bounded hardware handshake exceeded its iteration ceiling.
    ///
    /// Logged as fatal for the operation. The recommended recovery is a
    /// full controller reset, not a silent retry.
    HardwareTimeout(Handshake),
}

/// Names the bounded polling loop that timed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handshake {
    /// Setup capture tripwire (`SUTW`).
    SetupTripwire,
    /// Add-dTD tripwire (`ATDTW`).
    AddTripwire,
    /// Endpoint FIFO flush.
    Flush,
    /// Controller reset self-clear.
    ControllerReset,
}

/// Completion status of a retired [`Request`](crate::Request).
///
/// Descriptor error flags are decoded in priority order
/// `Halted > BufferError > TransactionError > Success`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// All descriptors retired cleanly.
    Success,
    /// Endpoint protocol violation. The endpoint halts; clear the halt
    /// to reset the data toggle and continue.
    Halted,
    /// Data over- or underrun. The endpoint continues.
    BufferError,
    /// Bit-level transport failure. The endpoint continues.
    TransactionError,
    /// The request was dequeued, or the queue was flushed by a bus
    /// reset or disconnect.
    Cancelled,
    /// Descriptor allocation failed while building the transfer.
    OutOfMemory,
}

impl TransferStatus {
    /// Indicates if this status reports a failed transfer.
    pub fn is_error(self) -> bool {
        self != TransferStatus::Success
    }

    /// Severity used to fold per-descriptor flags into one status.
    pub(crate) fn severity(self) -> u8 {
        match self {
            TransferStatus::Halted => 3,
            TransferStatus::BufferError => 2,
            TransferStatus::TransactionError => 1,
            _ => 0,
        }
    }
}

/// Rejection of a control request by the function driver.
///
/// Any variant stalls both directions of endpoint 0; the state machine
/// recovers on the next setup packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlError {
    /// The request is not supported by this function.
    Unsupported,
    /// The request was recognized but its payload is invalid.
    Invalid,
}
