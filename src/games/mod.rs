pub mod protocol;
pub mod types;

pub use protocol::{DetectCommand, DetectParams, DetectResponse};
pub use types::*;
