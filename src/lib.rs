pub mod client;
pub mod fingerprint;
pub mod registry;
pub mod server;
pub mod sign;
pub mod supervisor;

pub use client::{UpstreamClient, UpstreamError};
pub use fingerprint::{DeviceIdProvider, SandboxDeviceIdProvider};
pub use registry::ClientRegistry;
pub use sign::{Signature, sign};
