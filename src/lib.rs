pub mod batch;
pub mod config;
pub mod cve;
pub mod executor;
pub mod fakes;
pub mod git;
pub mod github;
pub mod model;
pub mod nix;
pub mod outpaths;
pub mod telemetry;
pub mod throttle;
pub mod traits;
pub mod update;
pub mod version;

// Re-export common types for convenience
pub use batch::{BatchDriver, BatchSummary, RunLog};
pub use config::{Config, ThrottleConfig, UpdateOptions};
pub use executor::*;
pub use model::*;
pub use outpaths::{OutpathSet, RebuildEstimator};
pub use telemetry::init_tracing;
pub use throttle::{HttpLoadSignal, Throttle};
pub use traits::*;
pub use update::{UpdateError, UpdateOutcome, UpdatePipeline};
