pub mod client;
pub mod error;
mod rows;
pub mod schema;
pub mod server;
pub mod traits;

pub use client::SqliteClientStore;
pub use error::StorageError;
pub use rows::unix_millis;
pub use server::SqliteServerStore;
pub use traits::*;
