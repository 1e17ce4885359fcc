//! Wire protocol constants shared by the server and the client.

/// Body returned by the health path.
pub const PROTOCOL_VERSION: &str = "v1";

/// Body returned before the server exits on request.
pub const QUIT_ACK: &str = "quitting...";

pub const PING_PATH: &str = "/ping";
pub const SECRETS_PATH: &str = "/secrets";
pub const QUIT_PATH: &str = "/quit";
pub const AGENT_FORWARDER_PATH: &str = "/ssh-agent-forwarder";
