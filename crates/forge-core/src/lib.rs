pub mod applier;
pub mod config;
pub mod event_bus;

pub use applier::*;
pub use config::*;
pub use event_bus::*;
