//! Verification outcomes.

/// The result of a successful call to `verify_event`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::exhaustive_enums)]
pub enum Verified {
    /// The event's signatures are valid but its content hash does not match,
    /// so the event must be redacted before use.
    Signatures,

    /// Both the signatures and the content hash are valid.
    All,
}
