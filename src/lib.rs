pub mod actors;
pub mod cache;
pub mod concurrency;
pub mod config;
pub mod domain;
pub mod errors;
pub mod gateway;
pub mod metrics;
pub mod services;
pub mod storage;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;
