//! Testing utilities for the storage layer
//!
//! - **Reference Model**: naive linear-scan model of a backing chain, used to
//!   check that allocation-map resolution and merges never diverge from the
//!   obvious semantics.
//!
//! # Example
//!
//! ```ignore
//! use livemerge_storage::testing::ReferenceChain;
//!
//! let mut model = ReferenceChain::new(512, 4096);
//! model.write(0, &[1u8; 3072]);
//! model.push_layer();
//! model.write(1024, &[2u8; 2048]);
//! assert_eq!(model.read(1024, 1)[0], 2);
//! ```

mod reference_model;

pub use reference_model::ReferenceChain;
