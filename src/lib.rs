// src/lib.rs

// Import the top-level `consilium` module.
pub mod consilium;

// Re-exporting key items for easier external access.
pub use consilium::agent::{AgentReport, AnalysisAgent, Citation, Finding};
pub use consilium::classifier::{Classification, Classifier, Complexity, Intent};
pub use consilium::config::EngineConfig;
pub use consilium::event::{Event, EventStatus, EventStream, StageTag};
pub use consilium::state::{AnalysisRequest, AnalysisState, Query};
pub use consilium::workflow::{DeliberationEngine, DeliberationRun};
