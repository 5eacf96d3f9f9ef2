//! Read-only consistency checks
//!
//! The checks mirror what an external observer of a merge looks at: where
//! each layer's backing reference points and how it is written down, the
//! declared format, and the bytes a reader sees over a range. Nothing here
//! takes the chain lease or mutates state.

use std::fmt;

use livemerge_core::{BackingMode, ImageFormat, LayerId, Result};
use serde::Serialize;

use crate::chain::{backing_ref, Violation};
use crate::state::ChainState;

/// First byte that did not match an expected pattern
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatternMismatch {
    /// Offset of the mismatching byte
    pub offset: u64,
    /// Expected value
    pub expected: u8,
    /// Value read
    pub actual: u8,
}

impl fmt::Display for PatternMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "byte at offset {} is {:#04x}, expected {:#04x}",
            self.offset, self.actual, self.expected
        )
    }
}

/// Find the first byte in `data` (read at `offset`) that is not `expected`
pub fn find_mismatch(data: &[u8], offset: u64, expected: u8) -> Option<PatternMismatch> {
    data.iter()
        .position(|b| *b != expected)
        .map(|i| PatternMismatch {
            offset: offset + i as u64,
            expected,
            actual: data[i],
        })
}

/// Structured description of a failed check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Mismatch {
    /// Stored backing reference differs from the expected one
    Backing {
        /// Checked layer
        layer: String,
        /// Reference that should be stored
        expected: Option<String>,
        /// Reference actually stored
        actual: Option<String>,
    },
    /// Declared format differs
    Format {
        /// Checked layer
        layer: String,
        /// Expected format
        expected: ImageFormat,
        /// Declared format
        actual: ImageFormat,
    },
    /// Logical content differs from the pattern
    Pattern(PatternMismatch),
    /// Chain structure is broken
    Chain(Vec<Violation>),
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mismatch::Backing {
                layer,
                expected,
                actual,
            } => write!(
                f,
                "{} backing is {}, expected {}",
                layer,
                actual.as_deref().unwrap_or("<none>"),
                expected.as_deref().unwrap_or("<none>")
            ),
            Mismatch::Format {
                layer,
                expected,
                actual,
            } => write!(f, "{} format is {}, expected {}", layer, actual, expected),
            Mismatch::Pattern(p) => write!(f, "{}", p),
            Mismatch::Chain(violations) => {
                write!(f, "{} chain violation(s)", violations.len())
            }
        }
    }
}

/// Checks against one chain
#[derive(Debug, Clone, Copy)]
pub struct ConsistencyVerifier<'a> {
    state: &'a ChainState,
}

impl<'a> ConsistencyVerifier<'a> {
    /// Verifier over `state`
    pub fn new(state: &'a ChainState) -> Self {
        Self { state }
    }

    /// Check that `layer` stores exactly the reference `expected` would produce
    ///
    /// `expected` is the backing layer and the encoding the reference should
    /// use; `None` means the layer should be standalone. A relative and an
    /// absolute reference to the same layer do not match.
    pub fn check_backing(
        &self,
        layer: &LayerId,
        expected: Option<(LayerId, BackingMode)>,
    ) -> Result<Option<Mismatch>> {
        let model = self.state.model();
        let l = model.layer(layer)?;
        let expected_path = match expected {
            Some((backing, mode)) => {
                Some(backing_ref(&l.location, model.layer(&backing)?, mode)?.path)
            }
            None => None,
        };
        let actual_path = l.backing.as_ref().map(|b| b.path.clone());
        if expected_path == actual_path {
            return Ok(None);
        }
        Ok(Some(Mismatch::Backing {
            layer: l.name.clone(),
            expected: expected_path,
            actual: actual_path,
        }))
    }

    /// Check that the stored reference of `layer`, once resolved against
    /// the layer's own location, names `expected`'s storage
    pub fn backing_resolves_to(&self, layer: &LayerId, expected: &LayerId) -> Result<bool> {
        let model = self.state.model();
        let l = model.layer(layer)?;
        let target = model.layer(expected)?.location.absolute();
        Ok(l
            .backing
            .as_ref()
            .map(|b| l.location.resolve_backing_path(&b.path) == target)
            .unwrap_or(false))
    }

    /// Check the declared format of `layer`
    pub fn check_format(&self, layer: &LayerId, expected: ImageFormat) -> Result<Option<Mismatch>> {
        let model = self.state.model();
        let l = model.layer(layer)?;
        if l.format == expected {
            return Ok(None);
        }
        Ok(Some(Mismatch::Format {
            layer: l.name.clone(),
            expected,
            actual: l.format,
        }))
    }

    /// Check that every byte of the active layer's view in range is `pattern`
    pub fn check_pattern(&self, offset: u64, len: u64, pattern: u8) -> Result<Option<Mismatch>> {
        let data = self.state.read(offset, len)?;
        Ok(find_mismatch(&data, offset, pattern).map(Mismatch::Pattern))
    }

    /// Same as [`check_pattern`](Self::check_pattern) through a given layer
    pub fn check_layer_pattern(
        &self,
        layer: &LayerId,
        offset: u64,
        len: u64,
        pattern: u8,
    ) -> Result<Option<Mismatch>> {
        let data = self.state.read_layer(layer, offset, len)?;
        Ok(find_mismatch(&data, offset, pattern).map(Mismatch::Pattern))
    }

    /// Check the chain structure
    pub fn check_chain(&self) -> Option<Mismatch> {
        let violations = self.state.validate();
        (!violations.is_empty()).then_some(Mismatch::Chain(violations))
    }
}
