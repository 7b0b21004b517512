pub mod cli;
pub mod config;
pub mod family;
pub mod forward;
pub mod freeze;
pub mod health;
pub mod logging;
pub mod requestlog;
pub mod selection;
pub mod server;

pub use family::Family;
