pub mod engine;
pub mod image;

pub use engine::VerificationEngine;
pub use image::{ImageFetchError, ImagePayload, ImagePreprocessor, PreprocessMode};
