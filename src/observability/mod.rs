//! Observability for the MQTT TLS client
//!
//! Structured logging through `tracing`, plus span macros for publisher and
//! reconnect activity.

pub mod logging;

// Re-export for convenience
pub use logging::{init_default_logging, init_logging, LogFormat};

// Span macros for structured logging
pub use logging::{lifecycle_span, mqtt_span};
