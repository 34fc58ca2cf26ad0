//! Testing utilities and mock implementations
//!
//! Mocks for the transport and reconnect seams, so the publisher, the
//! subscription hook and reconnect episodes can be exercised without a broker.

pub mod mocks;

pub use mocks::*;
