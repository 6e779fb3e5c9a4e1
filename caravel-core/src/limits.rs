//! System-wide limits.
//!
//! Put limits on everything: every queue, buffer, and message has an
//! explicit maximum size so the system stays predictable under load.

/// Maximum size of a single encoded peer message in bytes.
pub const MAX_MESSAGE_BYTES: usize = 4 * 1024 * 1024;

/// Maximum size of a single client command payload in bytes.
pub const MAX_COMMAND_BYTES: usize = 1024 * 1024;

/// Maximum number of log entries carried by one append request.
pub const MAX_ENTRIES_PER_APPEND: usize = 1000;

/// Maximum number of voting members in a cluster.
pub const CLUSTER_SIZE_MAX: usize = 9;

/// Default bound on queued-but-unconsumed inbound messages.
pub const MAX_PENDING_DEFAULT: usize = 100;
