pub mod cli;
pub mod config;
pub mod context;
pub mod dependency;
pub mod error;
pub mod finding;
pub mod module;
pub mod performer;
pub mod processors;
pub mod registry;
pub mod reporters;
pub mod runner;
pub mod scanners;

// re-export the types modules and tests touch most
pub use crate::context::{RunContext, Stage};
pub use crate::error::{ConfigError, ErrorRecord, ExecuteError, PrepareError};
pub use crate::finding::{Finding, Severity};
pub use crate::module::{Module, ModuleFactory, ModuleState};
pub use crate::performer::{Observer, Performer, StageScheduler};
pub use crate::registry::{FactoryRegistry, ModuleRegistry};
