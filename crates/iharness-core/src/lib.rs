pub mod check;
pub mod codec;
pub mod config;
pub mod environment;
pub mod types;
pub mod version;

pub use check::{CheckError, CheckType, Expectation};
pub use codec::EnvFormat;
pub use config::HarnessConfig;
pub use environment::{ClientProfile, EnvironmentDocument};
pub use types::*;
pub use version::{ProtocolVersion, VersionEra};
