pub mod languages;
pub mod limits;
pub mod submission;
pub mod verdict;

pub use languages::{LanguageInfo, Registry, RunnerDescriptor};
pub use limits::{Limit, LimitOverride, ResourceLimits};
pub use submission::{SourceFile, Submission, STDIN_FILE};
pub use verdict::{Classification, ExecutionResult, Phase};
