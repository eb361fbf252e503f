mod config;
mod constants;
mod data;
mod duration;
mod error;
mod script;
mod threshold;

pub use config::*;
pub use constants::*;
pub use data::*;
pub use duration::HumanDuration;
pub use error::*;
pub use script::*;
pub use threshold::*;
