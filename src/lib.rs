//! b2daq-rs: COPPER raw-data decoding and TOP time calibration
//!
//! This crate reads the word-oriented blocks produced by COPPER readout
//! boards, dispatches each block to a per-detector unpacker and, for the
//! TOP detector, turns production-debug hits into calibrated digits.
//!
//! - [`rawdata`]: block layout, checksums, packing and sequence checks
//! - [`top`]: ProdDebug decoder, front-end mapping, calibration payloads
//!   and the raw-digit converter
//! - [`registry`] / [`event`]: detector dispatch and per-event output
//! - [`pipeline`]: reader → workers → collector run over a block stream
//! - [`recorder`]: raw data file format with crash recovery
//! - [`data_source_emulator`]: synthetic TOP blocks for tests and tools

pub mod common;
pub mod config;
pub mod data_source_emulator;
pub mod event;
pub mod pipeline;
pub mod rawdata;
pub mod recorder;
pub mod registry;
pub mod top;
