//! ERC-4337 smart-account execution pipeline.
//!
//! Turns a caller's `Call[]` into a signed user operation for a counterfactual
//! smart account, optionally sponsored by an ERC-7677 paymaster, submits it to
//! a bundler and tracks it until inclusion. [`Pipeline`] wires the pieces;
//! [`ExecutionOrchestrator`] drives one send through its state machine.

pub mod account;
pub mod address;
pub mod builder;
pub mod bundler;
pub mod chain;
pub mod config;
pub mod encoding;
pub mod error;
pub mod gas;
pub mod nonce;
pub mod orchestrator;
pub mod paymaster;
pub mod race;
pub mod receipt;
pub mod retry;
pub mod rpc;
pub mod signer;
pub mod types;

#[cfg(test)]
mod test_utils;

pub use config::{load_config, Overrides, PipelineConfig};
pub use error::{BundlerRejection, ExecError, SendError};
pub use orchestrator::{BatchState, ExecutionOrchestrator, Pipeline, SendOptions};
pub use types::{Call, OperationHandle, Receipt, SmartAccountRef, UserOperation};
