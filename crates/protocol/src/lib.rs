pub mod config;
pub mod messages;
pub mod turn;

pub use config::*;
pub use messages::*;
pub use turn::*;
