pub mod engine;

pub use engine::{PricingEngine, PricingError};
