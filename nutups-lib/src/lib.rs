pub mod config;
pub mod error;
pub mod model;
pub mod monitor;
pub mod nut;
pub mod protocol;
pub mod rate_limit;
pub mod sink;
pub mod transport;
pub mod vendors;

// Re-export the common entry points for easy access.
pub use config::Config;
pub use error::UpsError;
pub use model::UpsData;
pub use monitor::UpsMonitor;
pub use nut::{NutServer, UpsDataProvider};
