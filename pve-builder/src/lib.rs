pub mod builder;
pub mod client;
pub mod config;
pub mod multistep;
pub mod steps;
