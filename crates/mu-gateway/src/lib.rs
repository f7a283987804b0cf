//! The mu control-plane gateway: HTTP surface, adapter generations,
//! operator tooling, and the wiring that assembles the pipeline, outbox
//! dispatcher, run supervisor, and program registries into one process.

pub mod app;
pub mod deliver;
pub mod generation;
pub mod http;
pub mod server_meta;
pub mod telemetry;
pub mod tooling;
pub mod wake;
