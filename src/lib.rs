//! Multisig Library
//!
//! Multi-channel test signal generator with a low-latency PipeWire output stream.

pub mod audio;
pub mod control;
pub mod engine;
