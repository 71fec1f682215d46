pub mod config;
pub mod error;
pub mod difficulty;
pub mod vardiff;
pub mod session;
pub mod jobs;
pub mod sweeper;
pub mod stratum;
pub mod shares;
pub mod blockchain;
pub mod metrics;

// In-memory collaborators shared by unit and integration tests
#[cfg(any(test, feature = "test-utils"))]
#[doc(hidden)]
pub mod test_utils;
