mod processor;

pub use processor::{AudioAnalysis, AudioProcessor};
