//! End-to-end live-merge scenarios
//!
//! Forward and backward merges on three-layer chains, run across the image
//! permutation matrix, plus the block-job polling protocol and the
//! volume-growth monitor.

mod harness;
mod matrix;
mod polling;
mod scenarios;
mod volume_growth;
