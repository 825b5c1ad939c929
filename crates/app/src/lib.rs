pub mod runtime;
pub mod settings;

pub use runtime::TranscriptionPipeline;
pub use settings::Settings;
