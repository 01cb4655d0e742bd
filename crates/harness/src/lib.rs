//! Fixtures for driving devices against a sync server in tests.

mod device;
mod logging;
mod network;
mod server;

pub use device::TestDevice;
pub use logging::init_tracing;
pub use network::{Fault, FaultPlan, LoopbackTransport, TestNetwork};
pub use server::TestServer;
