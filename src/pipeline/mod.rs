pub mod analysis;
pub mod orchestrator;
pub mod prompts;
pub mod render;
pub mod request;
pub mod validate;

pub use analysis::AnalysisResult;
pub use orchestrator::{MarketAnalyzer, PipelineResult, PipelineSettings, RunStatus};
pub use prompts::Facet;
pub use render::Report;
pub use request::{AnalysisRequest, Depth};
