pub mod error;
pub mod export;
pub mod generator;
pub mod orchestrator;
pub mod slot;
pub mod theme;

pub use export::export_all;
pub use generator::{ImageGenerator, QualityMode};
pub use orchestrator::{BatchOrchestrator, BatchSummary, DispatchPolicy, RetryTarget};
pub use theme::PromptTable;
