pub mod config;
pub mod errors;
pub mod seeds;
pub mod system;
pub mod trajectory;

pub use config::*;
pub use errors::*;
pub use seeds::*;
pub use system::*;
pub use trajectory::*;
