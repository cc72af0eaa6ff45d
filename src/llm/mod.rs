pub mod gemini;
pub mod media;

pub use gemini::GeminiImageClient;
pub use media::read_upload;
