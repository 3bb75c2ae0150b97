pub mod checkpoint;
pub mod config;
pub mod driver;
pub mod errors;
pub mod logging;
pub mod orchestrator;
pub mod pool;
pub mod session;
pub mod signals;
pub mod team;
pub mod tracker;
