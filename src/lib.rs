#![forbid(unsafe_code)]

//! Asynchronous media conversion jobs: links or uploads in, downloadable
//! artifacts out, with progress polling in between.

pub mod artifact;
pub mod config;
pub mod error;
pub mod identifier;
pub mod invoker;
pub mod process;
pub mod profile;
pub mod progress;
pub mod runner;
pub mod service;
pub mod status;
pub mod store;
pub mod transcode;

#[cfg(test)]
mod test_support;
