mod analyses;
mod calls;
mod results;
mod transcripts;

pub use analyses::AnalysesRepository;
pub use calls::CallsRepository;
pub use results::{ResultRow, ResultsPage, ResultsQuery, ResultsRepository, SortDirection};
pub use transcripts::TranscriptsRepository;
