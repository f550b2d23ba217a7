pub mod collaborators;
pub mod daemon;
pub mod error;
mod events;
pub mod registry;
pub mod scheduler;
mod shared_data;

pub use collaborators::{ActivityExecutor, DryRunExecutor, RankingService, UnavailableRanking};
pub use daemon::{
    DaemonOptions, RunMode, SchedulerHandle, StatusSnapshot, StoreAccess, bootstrap,
    open_read_only, open_store, spawn,
};
pub use error::{ConfigError, SchedulerError};
pub use events::SchedulerEvent;
pub use registry::{ActivityDescriptor, ConstraintRegistry, NextAvailable, eligible};
pub use scheduler::{
    CycleOutcome, CycleReport, Decision, FallbackReason, Phase, Scheduler, SchedulerSettings,
    ScoringWeights,
};
pub use shared_data::SharedData;
