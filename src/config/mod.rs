//! Engine configuration and procedure loading

mod error;
mod loader;
mod ttp;

pub use error::LoadError;
pub use loader::EngineConfig;
pub use ttp::{ArgSpec, MitreInfo, StepConfig, Ttp, TtpConfig};
