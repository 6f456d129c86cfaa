//! Infrastructure layer for the fiscal pipeline: persistence, the emission
//! job queue and worker, provider gateways, artifact storage, secret
//! encryption and configuration.

pub mod cipher;
pub mod config;
pub mod error;
pub mod gateway;
pub mod jobs;
pub mod memory;
pub mod postgres;
pub mod service;
pub mod storage;
pub mod store;

#[cfg(test)]
mod integration_tests;
#[cfg(test)]
pub(crate) mod testing;

pub use error::StoreError;
