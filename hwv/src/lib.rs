//! Hardware validation test orchestration.
//!
//! Scenarios are ordered lists of steps run against validation targets over
//! SSH, Redfish or the local shell. Steps can gate on entry criteria, run in
//! the background and be validated at the end of the run, and feed their
//! output through regex analyzers that record boolean parameters and
//! diagnostic codes.
//!
//! The [`engine::Engine`] bundles the state one run shares; the
//! [`orchestrator::Orchestrator`] drives it.

pub mod analysis;
pub mod artifacts;
pub mod connection;
pub mod containers;
pub mod context;
pub mod engine;
pub mod executor;
pub mod expression;
pub mod loader;
pub mod orchestrator;
pub mod pool;
pub mod process;
pub mod results;
pub mod runner;
pub mod step;
pub mod task;
pub mod validator;

pub use context::DiagnosticContext;
pub use engine::{Engine, Workspace};
pub use orchestrator::{Orchestrator, RunReport};
pub use results::ResultCollector;
