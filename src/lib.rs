pub mod catalog;
pub mod config;
pub mod errors;
pub mod job_scheduling;
pub mod resources;
