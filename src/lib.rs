/* \page GatewayOverview Gateway Overview
WireGuard overlay gateway control plane.

- Address-space partitioning (`subnet.rs`) and peer address allocation (`allocator.rs`).
- Server key management (`keys.rs`).
- Peer records and their durable store (`peer_registry.rs`).
- WireGuard device control (`wg.rs`) and interface bring-up (`lifecycle.rs`).
- Per-peer client builds (`artifact.rs`).
- Registration flow (`service.rs`) and its HTTP API (`enroll_http.rs`).
- Configuration (`config.rs`) and process orchestration (`runtime.rs`).
*/
pub mod allocator;
pub mod artifact;
pub mod config;
pub mod enroll_http;
pub mod error;
pub mod keys;
pub mod lifecycle;
pub mod peer_registry;
pub mod runtime;
pub mod service;
pub mod subnet;
pub mod wg;

pub use error::GatewayError;
