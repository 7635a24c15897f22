//! Core event pipeline and control plane for an IoT edge gateway.
//!
//! This crate ships as a library: it does not provide a `main` binary.
//! Wiring a concrete set of connectors and a concrete cloud transport
//! implementation and starting the service is the responsibility of a
//! downstream binary crate, via [`GatewayBuilder`].

pub mod attributes;
pub mod config;
pub mod connector;
pub mod error;
pub mod event;
pub mod gateway;
pub mod handle;
pub mod ingress;
pub mod queues;
pub mod registry;
pub mod rpc;
pub mod statistics;
pub mod storage;
pub mod supervisor;
pub mod updater;
pub mod uplink;
pub mod utils;

pub use gateway::{GatewayBuilder, GatewayService};
pub use handle::GatewayHandle;

/// Test-only logging setup shared by every module's `#[cfg(test)] mod tests`,
/// mirroring the teacher's `env_logger::Builder::from_env(...).init()` at the
/// top of its `tests/*.rs` integration tests. Unit tests here all run in one
/// process, so initialization is guarded by `Once` rather than repeated
/// per-test.
#[cfg(test)]
pub(crate) mod test_log {
    use std::sync::Once;

    static INIT: Once = Once::new();

    pub fn init() {
        INIT.call_once(|| {
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug"))
                .is_test(true)
                .init();
        });
    }
}
