pub mod candidates;
pub mod coordinator; // Extractor → Candidates → Evidence, plus filter and research entry points
pub mod evidence;
pub mod extractor;
pub mod filter;
pub mod llm;
pub mod outcome;
pub mod repair; // Parse-or-repair gate shared by every stage
pub mod research;
pub mod sanitize;
pub mod types;

pub use coordinator::{AnalysisReport, ClinicalPipeline};
pub use filter::FilterError;
pub use outcome::{StageOutcome, StageStatus};
