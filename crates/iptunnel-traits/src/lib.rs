pub mod config;
pub mod keys;
pub mod logging;
pub mod process;
pub mod status;
pub mod supervisor;
