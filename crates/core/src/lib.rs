pub mod delta;
pub mod error;
pub mod hlc;
pub mod ids;
pub mod payload;
pub mod version;

pub use delta::{Operation, SyncDelta};
pub use error::CoreError;
pub use hlc::{Hlc, HlcClock};
pub use ids::*;
pub use payload::DeltaPayload;
pub use version::SyncVersion;
