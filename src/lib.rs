pub mod app;
pub mod config;
pub mod errors;
pub mod git;
pub mod isolation;
pub mod runner;
pub mod server;
pub mod topic;
pub mod wheel;
