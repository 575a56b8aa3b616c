pub mod apply;
pub mod config;
pub mod show;
pub mod sim;
