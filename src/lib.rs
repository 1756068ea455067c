//! # seatrack
//!
//! Headless telemetry recorder for remote sensor units. Samples arrive over
//! serial lines and an MQTT broker, are merged into a bounded shared buffer,
//! aggregated on a fixed cadence and recorded as checkpointed tracks.
//!
//! ## Crate Structure
//!
//! - **`transport`**: Serial and MQTT readers pushing [`sample::Sample`]s into the communicator.
//! - **`communicator`**: The shared buffer of recent values per address, unit liveness and
//!   ingest-time conversions (`preprocess`).
//! - **`aggregator`**: The timer turning communicator snapshots into `record::AggregatedRecord`s.
//! - **`track`**: The active recording with save-mode gating, trimming and checkpointing
//!   through `checkpoint::CheckpointStore`.
//! - **`archive`**, **`catalog`**, **`replay`**: Stored tracks, their listing and replay.
//! - **`recorder`**: The supervisor that starts, stops and reconfigures the pipeline.
//! - **`gps`**: Position projections over recorded data.
//! - **`config`**, **`error`**, **`logging`**: Layered configuration, the crate error type and
//!   tracing setup.

pub mod aggregator;
pub mod archive;
pub mod catalog;
pub mod checkpoint;
pub mod communicator;
pub mod config;
pub mod error;
pub mod gps;
pub mod liveness;
pub mod logging;
pub mod preprocess;
pub mod record;
pub mod recorder;
pub mod replay;
pub mod sample;
pub mod track;
pub mod transport;
pub mod trim;
