//! Application layer wiring services and adapters into a runtime.

pub mod runtime;

pub use runtime::{ResearchRuntime, RuntimeDeps, RuntimeState};
