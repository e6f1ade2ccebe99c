//! # Message Manager Configuration
//!
//! Configuration loading and defaults for the message manager.
//!
//! ## Features
//!
//! - **Defaults**: timeouts, script cache and reporter thresholds
//! - **Loading**: TOML file, optional environment overlay, `MSGMGR_` variables
//!
//! ## Usage
//!
//! ```rust
//! use manager_config::MessageManagerConfig;
//!
//! let config = MessageManagerConfig::from_toml_str("[transport]\npump_interval_ms = 5").unwrap();
//! assert_eq!(config.transport.pump_interval_ms, 5);
//! ```

pub mod defaults;
pub mod manager_config;

// Re-export commonly used types
pub use manager_config::{
    load_config, LoggingConfig, MessageManagerConfig, ReporterConfig, ScriptsConfig,
    TransportConfig,
};
