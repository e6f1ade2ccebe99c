//! Default values and constants
//!
//! Defaults used when a configuration file leaves a section or field out.

/// Logging defaults
pub mod logging {
    /// Default tracing filter directive
    pub const LEVEL: &str = "info";
}

/// Transport defaults
pub mod transport {
    /// Wait for sync replies forever
    pub const SYNC_REPLY_TIMEOUT_MS: u64 = 0;

    /// Bridge handshake timeout (milliseconds)
    pub const HANDSHAKE_TIMEOUT_MS: u64 = 5_000;

    /// Poll interval while pumping a pipe for inbound frames (milliseconds)
    pub const PUMP_INTERVAL_MS: u64 = 10;
}

/// Script loader defaults
pub mod scripts {
    pub const CACHE_ENABLED: bool = true;
}

/// Memory reporter defaults
pub mod reporter {
    /// Registrations per message name at which a name is reported as suspect
    pub const SUSPECT_REFERENT_COUNT: usize = 300;
}

/// Default configuration file location
pub const CONFIG_PATH: &str = "config/message_manager.toml";

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "MSGMGR";
