//! WebSocket close codes emitted by the `/judge` session.
//!
//! The codes are contract surface; reason strings are not.

/// A second `init` was received on an already-initialized session.
pub const ALREADY_INITIALIZED: u16 = 4000;
/// No valid `init` arrived within the initialization grace period.
pub const INIT_TIMEOUT: u16 = 4001;
/// The session failed after notifying the client with an `error` message.
pub const NOTIFIED_ERROR: u16 = 4002;
/// A command other than `init` arrived before the session was initialized.
pub const NOT_INITIALIZED: u16 = 4003;
/// The compile stage failed; the session is terminal.
pub const COMPILE_FAILED: u16 = 4006;
/// The session completed normally after `close`.
pub const COMPLETE: u16 = 4999;
