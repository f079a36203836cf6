//! Intent lifecycle controller: drives IntentDeployment objects from submission
//! to `Succeeded`, or through `Failed` and an optional rollback.

#![forbid(unsafe_code)]

pub mod config;
pub mod lifecycle;
pub mod pipeline;
pub mod queue;
pub mod runner;
pub mod script;
pub mod sim;

pub use config::{ControllerConfig, PipelineMode, PipelineSettings};
pub use lifecycle::{LifecycleController, ReconcileError};
pub use pipeline::{
    Compiler, Delivery, DeliveryReceipt, GateReport, Gates, Pipeline, Renderer, RollbackRequest, StepError,
    StepErrorKind, StepResult,
};
pub use runner::Runner;
pub use script::ScriptPipeline;
pub use sim::SimPipeline;
