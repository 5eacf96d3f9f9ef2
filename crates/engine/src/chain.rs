//! In-memory model of a backing chain
//!
//! A chain is a set of layers linked by backing references. Members form a
//! single line from the base (no backing) to the active layer (no member
//! backs onto it). Layers cut out of that line by a relink stay in the model
//! with [`LayerStatus::RemovalPending`] until they are detached, so the
//! relink and the staging of removals are one transition.
//!
//! ## Invariants
//!
//! - Backing layers are at least as large as the layers referencing them
//! - No layer is its own ancestor
//! - Exactly one active layer
//!
//! [`ChainModel::validate`] reports violations instead of assuming them;
//! chains imported with [`ChainModel::from_layers`] are not checked.

use std::collections::BTreeSet;
use std::fmt;

use livemerge_core::{
    BackingMode, BackingRef, ChainId, Error, ImageFormat, LayerId, LayerLocation, Result,
    MAX_CHAIN_DEPTH,
};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use smallvec::SmallVec;
use tracing::debug;

/// Layers from some starting layer down to the base, nearest first
pub type LayerPath = SmallVec<[LayerId; 8]>;

/// Membership of a layer in its chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerStatus {
    /// Part of the line from base to active
    Member,
    /// Cut out by a merge; waiting to be detached
    RemovalPending,
}

/// One image in a chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layer {
    /// Identity
    pub id: LayerId,
    /// Image name, unique per engine
    pub name: String,
    /// Declared format
    pub format: ImageFormat,
    /// Declared size in bytes
    pub size: u64,
    /// Where the image lives
    pub location: LayerLocation,
    /// Pointer to the parent, as stored in this layer
    pub backing: Option<BackingRef>,
    /// Membership
    pub status: LayerStatus,
}

impl Layer {
    /// A standalone member layer
    pub fn new(
        id: LayerId,
        name: impl Into<String>,
        format: ImageFormat,
        size: u64,
        location: LayerLocation,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            format,
            size,
            location,
            backing: None,
            status: LayerStatus::Member,
        }
    }

    /// Check if the layer is part of the chain's line
    pub fn is_member(&self) -> bool {
        self.status == LayerStatus::Member
    }

    /// Identity of the backing layer, if any
    pub fn backing_layer(&self) -> Option<LayerId> {
        self.backing.as_ref().map(|b| b.layer)
    }
}

/// Build the reference `child` stores to point at `backing`
///
/// Relative references are only possible between files in the same
/// directory; anything else is `InvalidInput`.
pub fn backing_ref(child: &LayerLocation, backing: &Layer, mode: BackingMode) -> Result<BackingRef> {
    let path = match mode {
        BackingMode::Absolute => backing.location.absolute(),
        BackingMode::Relative => backing.location.relative_to(child).ok_or_else(|| {
            Error::InvalidInput(format!(
                "{} cannot be referenced by a path relative to {}",
                backing.location, child
            ))
        })?,
    };
    Ok(BackingRef {
        layer: backing.id,
        mode,
        path,
        format: backing.format,
    })
}

/// Structural problem found by [`ChainModel::validate`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Violation {
    /// Backing reference points at a layer that is not a member
    DanglingBacking {
        /// Referencing layer
        layer: LayerId,
        /// Missing or removed backing layer
        backing: LayerId,
    },
    /// Layer is its own ancestor (reported once per cycle)
    Cycle {
        /// Smallest layer id on the cycle
        layer: LayerId,
    },
    /// More than one member has no member backing onto it
    MultipleActive {
        /// Every candidate active layer
        layers: Vec<LayerId>,
    },
    /// No member qualifies as the active layer
    NoActive,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::DanglingBacking { layer, backing } => {
                write!(f, "{} has dangling backing reference to {}", layer, backing)
            }
            Violation::Cycle { layer } => write!(f, "{} is its own ancestor", layer),
            Violation::MultipleActive { layers } => {
                write!(f, "{} candidate active layers", layers.len())
            }
            Violation::NoActive => f.write_str("no active layer"),
        }
    }
}

/// Backing structure of one layer, for before/after comparisons
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LayerSummary {
    /// Identity
    pub id: LayerId,
    /// Image name
    pub name: String,
    /// Stored backing reference
    pub backing: Option<BackingRef>,
    /// Membership
    pub status: LayerStatus,
}

/// Backing structure of a whole chain, sorted by layer name
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainSnapshot {
    /// Chain identity
    pub chain: ChainId,
    /// Every layer in the model
    pub layers: Vec<LayerSummary>,
}

/// The backing chain
#[derive(Debug, Clone)]
pub struct ChainModel {
    id: ChainId,
    layers: FxHashMap<LayerId, Layer>,
}

impl ChainModel {
    /// Create an empty chain
    pub fn new(id: ChainId) -> Self {
        Self {
            id,
            layers: FxHashMap::default(),
        }
    }

    /// Import layers as they are, without checking any invariant
    pub fn from_layers(id: ChainId, layers: impl IntoIterator<Item = Layer>) -> Self {
        Self {
            id,
            layers: layers.into_iter().map(|l| (l.id, l)).collect(),
        }
    }

    /// Chain identity
    pub fn id(&self) -> ChainId {
        self.id
    }

    /// Number of layers, including those pending removal
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Check if the model holds no layers at all
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Number of member layers
    pub fn depth(&self) -> usize {
        self.members().count()
    }

    /// Layer by id
    pub fn get(&self, id: &LayerId) -> Option<&Layer> {
        self.layers.get(id)
    }

    /// Layer by id, or `UnknownLayer`
    pub fn layer(&self, id: &LayerId) -> Result<&Layer> {
        self.layers
            .get(id)
            .ok_or_else(|| Error::UnknownLayer(id.to_string()))
    }

    /// Layer by name
    pub fn find(&self, name: &str) -> Option<&Layer> {
        self.layers.values().find(|l| l.name == name)
    }

    /// Every layer, in no particular order
    pub fn layers(&self) -> impl Iterator<Item = &Layer> {
        self.layers.values()
    }

    /// Member layers, in no particular order
    pub fn members(&self) -> impl Iterator<Item = &Layer> {
        self.layers.values().filter(|l| l.is_member())
    }

    fn name_of(&self, id: &LayerId) -> String {
        self.layers
            .get(id)
            .map(|l| l.name.clone())
            .unwrap_or_else(|| id.to_string())
    }

    /// Members that no other member backs onto
    pub fn heads(&self) -> Vec<LayerId> {
        let referenced: FxHashSet<LayerId> =
            self.members().filter_map(|l| l.backing_layer()).collect();
        let mut heads: Vec<LayerId> = self
            .members()
            .map(|l| l.id)
            .filter(|id| !referenced.contains(id))
            .collect();
        heads.sort();
        heads
    }

    /// The active layer, when there is exactly one
    pub fn active(&self) -> Option<LayerId> {
        match self.heads().as_slice() {
            [only] => Some(*only),
            _ => None,
        }
    }

    /// The active layer, or `InvalidInput` when the chain has none
    pub fn require_active(&self) -> Result<LayerId> {
        self.active().ok_or_else(|| {
            Error::InvalidInput(format!("chain {} has no single active layer", self.id))
        })
    }

    /// Member that backs onto `layer`
    pub fn child_of(&self, layer: &LayerId) -> Option<LayerId> {
        self.members()
            .find(|l| l.backing_layer() == Some(*layer))
            .map(|l| l.id)
    }

    /// Layer that `layer` backs onto
    pub fn resolve_backing(&self, layer: &LayerId) -> Result<Option<&Layer>> {
        match self.layer(layer)?.backing_layer() {
            Some(backing) => Ok(Some(self.layer(&backing)?)),
            None => Ok(None),
        }
    }

    /// `layer` followed by each of its ancestors down to the base
    pub fn path_from(&self, layer: &LayerId) -> Result<LayerPath> {
        self.layer(layer)?;
        let mut path = LayerPath::new();
        let mut current = Some(*layer);
        while let Some(id) = current {
            if path.contains(&id) || path.len() >= MAX_CHAIN_DEPTH {
                return Err(Error::Cycle {
                    layer: self.name_of(layer),
                    backing: self.name_of(&id),
                });
            }
            path.push(id);
            current = self.layer(&id)?.backing_layer();
        }
        Ok(path)
    }

    /// Path from the active layer to the base
    pub fn active_path(&self) -> Result<LayerPath> {
        self.path_from(&self.require_active()?)
    }

    /// Check if `ancestor` is strictly below `layer`
    pub fn is_ancestor(&self, ancestor: &LayerId, layer: &LayerId) -> Result<bool> {
        Ok(self.path_from(layer)?[1..].contains(ancestor))
    }

    fn check_link(&self, child: &Layer, backing: &LayerId) -> Result<()> {
        let parent = self.layer(backing)?;
        if !parent.is_member() {
            return Err(Error::InvalidInput(format!(
                "{} is pending removal and cannot back {}",
                parent.name, child.name
            )));
        }
        if !child.format.supports_backing() {
            return Err(Error::Format {
                layer: child.name.clone(),
                reason: format!("{} images cannot have a backing file", child.format),
            });
        }
        if parent.size < child.size {
            return Err(Error::Size {
                layer: child.name.clone(),
                backing: parent.name.clone(),
                backing_size: parent.size,
                required: child.size,
            });
        }
        Ok(())
    }

    /// Add a new layer, backed by `backing`
    ///
    /// A chain grows at the top only: the backing must be the current active
    /// layer, or absent when the chain is empty.
    pub fn attach(&mut self, mut layer: Layer, backing: Option<LayerId>, mode: BackingMode) -> Result<()> {
        if let Some(existing) = self.layers.get(&layer.id) {
            return Err(Error::InvalidInput(format!(
                "{} is already attached to chain {}",
                existing.name, self.id
            )));
        }
        match backing {
            Some(b) if b == layer.id => {
                return Err(Error::Cycle {
                    layer: layer.name.clone(),
                    backing: layer.name.clone(),
                });
            }
            Some(b) => {
                self.check_link(&layer, &b)?;
                let active = self.require_active()?;
                if b != active {
                    return Err(Error::InvalidInput(format!(
                        "{} must be backed by the active layer {}",
                        layer.name,
                        self.name_of(&active)
                    )));
                }
                layer.backing = Some(backing_ref(&layer.location, self.layer(&b)?, mode)?);
            }
            None if self.depth() > 0 => {
                return Err(Error::InvalidInput(format!(
                    "chain {} already has a base; {} needs a backing layer",
                    self.id, layer.name
                )));
            }
            None => layer.backing = None,
        }
        layer.status = LayerStatus::Member;
        debug!(
            target: "livemerge::chain",
            chain = %self.id,
            layer = %layer.name,
            backing = layer.backing.as_ref().map(|b| b.path.as_str()).unwrap_or("-"),
            "Attached layer"
        );
        self.layers.insert(layer.id, layer);
        Ok(())
    }

    /// Point a member at a new backing layer further down its own path
    ///
    /// With `backing = None` the layer becomes standalone. Every layer that
    /// drops out of the line is staged for removal in the same step; the
    /// staged layers are returned.
    pub fn relink(
        &mut self,
        layer: &LayerId,
        backing: Option<LayerId>,
        mode: BackingMode,
    ) -> Result<Vec<LayerId>> {
        let current = self.layer(layer)?.clone();
        if !current.is_member() {
            return Err(Error::InvalidInput(format!(
                "{} is pending removal",
                current.name
            )));
        }
        let path = self.path_from(layer)?;
        let (new_ref, orphans) = match backing {
            Some(b) => {
                if b == *layer || self.path_from(&b)?.contains(layer) {
                    return Err(Error::Cycle {
                        layer: current.name.clone(),
                        backing: self.name_of(&b),
                    });
                }
                let pos = path.iter().position(|id| *id == b).ok_or_else(|| {
                    Error::InvalidInput(format!(
                        "{} is not an ancestor of {}",
                        self.name_of(&b),
                        current.name
                    ))
                })?;
                self.check_link(&current, &b)?;
                let new_ref = backing_ref(&current.location, self.layer(&b)?, mode)?;
                (Some(new_ref), path[1..pos].to_vec())
            }
            None => (None, path[1..].to_vec()),
        };

        let orphans: Vec<LayerId> = orphans
            .into_iter()
            .filter(|id| self.layers.get(id).map_or(false, Layer::is_member))
            .collect();
        self.stage_removal(&orphans);
        if let Some(l) = self.layers.get_mut(layer) {
            l.backing = new_ref;
        }
        debug!(
            target: "livemerge::chain",
            chain = %self.id,
            layer = %current.name,
            backing = backing.map(|b| self.name_of(&b)).unwrap_or_else(|| "-".to_string()),
            staged = orphans.len(),
            "Relinked layer"
        );
        Ok(orphans)
    }

    /// Mark layers as pending removal
    pub fn stage_removal(&mut self, layers: &[LayerId]) {
        for id in layers {
            if let Some(l) = self.layers.get_mut(id) {
                l.status = LayerStatus::RemovalPending;
            }
        }
    }

    /// Remove a layer from the model
    ///
    /// Fails with `ActiveLayer` for the active layer (no designated
    /// replacement exists) and with `LayerInUse` while any layer still backs
    /// onto it.
    pub fn detach(&mut self, layer: &LayerId) -> Result<Layer> {
        let target = self.layer(layer)?;
        if target.is_member() && self.active() == Some(*layer) {
            return Err(Error::ActiveLayer {
                layer: target.name.clone(),
                reason: "cannot detach: no designated replacement".to_string(),
            });
        }
        if let Some(child) = self.layers.values().find(|l| l.backing_layer() == Some(*layer)) {
            return Err(Error::LayerInUse {
                layer: target.name.clone(),
                child: child.name.clone(),
            });
        }
        let removed = self
            .layers
            .remove(layer)
            .ok_or_else(|| Error::UnknownLayer(layer.to_string()))?;
        debug!(target: "livemerge::chain", chain = %self.id, layer = %removed.name, "Detached layer");
        Ok(removed)
    }

    /// Layers pending removal, ordered so that each can be detached in turn
    pub fn removal_order(&self) -> Vec<LayerId> {
        let mut pending: Vec<&Layer> = self
            .layers
            .values()
            .filter(|l| !l.is_member())
            .collect();
        pending.sort_by(|a, b| a.name.cmp(&b.name));
        let mut order = Vec::with_capacity(pending.len());
        let mut remaining: FxHashSet<LayerId> = pending.iter().map(|l| l.id).collect();
        while !remaining.is_empty() {
            let before = order.len();
            for l in &pending {
                if !remaining.contains(&l.id) {
                    continue;
                }
                let referenced = self.layers.values().any(|c| {
                    c.backing_layer() == Some(l.id) && (c.is_member() || remaining.contains(&c.id))
                });
                if !referenced {
                    order.push(l.id);
                    remaining.remove(&l.id);
                }
            }
            if order.len() == before {
                break;
            }
        }
        order
    }

    /// Update the declared size of a layer
    pub fn set_size(&mut self, layer: &LayerId, size: u64) -> Result<()> {
        let l = self
            .layers
            .get_mut(layer)
            .ok_or_else(|| Error::UnknownLayer(layer.to_string()))?;
        l.size = size;
        Ok(())
    }

    /// Read-only scan for structural violations
    pub fn validate(&self) -> Vec<Violation> {
        let mut violations = Vec::new();

        let mut members: Vec<&Layer> = self.members().collect();
        members.sort_by_key(|l| l.id);

        for l in &members {
            if let Some(backing) = l.backing_layer() {
                let ok = self.layers.get(&backing).map_or(false, Layer::is_member);
                if !ok {
                    violations.push(Violation::DanglingBacking {
                        layer: l.id,
                        backing,
                    });
                }
            }
        }

        let mut reported: BTreeSet<LayerId> = BTreeSet::new();
        for l in &members {
            if reported.contains(&l.id) {
                continue;
            }
            let mut seen = vec![l.id];
            let mut current = l.backing_layer();
            while let Some(id) = current {
                if id == l.id {
                    let smallest = seen.iter().copied().min().unwrap_or(l.id);
                    reported.extend(seen.iter().copied());
                    violations.push(Violation::Cycle { layer: smallest });
                    break;
                }
                if seen.contains(&id) || seen.len() > self.layers.len() {
                    break;
                }
                seen.push(id);
                current = self.layers.get(&id).and_then(Layer::backing_layer);
            }
        }

        let heads = self.heads();
        match heads.len() {
            0 => violations.push(Violation::NoActive),
            1 => {}
            _ => violations.push(Violation::MultipleActive { layers: heads }),
        }
        violations
    }

    /// Backing structure of every layer
    pub fn snapshot(&self) -> ChainSnapshot {
        let mut layers: Vec<LayerSummary> = self
            .layers
            .values()
            .map(|l| LayerSummary {
                id: l.id,
                name: l.name.clone(),
                backing: l.backing.clone(),
                status: l.status,
            })
            .collect();
        layers.sort_by(|a, b| a.name.cmp(&b.name));
        ChainSnapshot {
            chain: self.id,
            layers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn file_layer(name: &str, format: ImageFormat, size: u64) -> Layer {
        Layer::new(
            LayerId::new(),
            name,
            format,
            size,
            LayerLocation::File(PathBuf::from(format!("/images/{}.img", name))),
        )
    }

    /// BASE -> S1 -> S2, all qcow2 of equal size
    fn three_layer_chain(mode: BackingMode) -> (ChainModel, LayerId, LayerId, LayerId) {
        let mut model = ChainModel::new(ChainId::new());
        let base = file_layer("BASE", ImageFormat::Qcow2, 4096);
        let s1 = file_layer("S1", ImageFormat::Qcow2, 4096);
        let s2 = file_layer("S2", ImageFormat::Qcow2, 4096);
        let (b, m, t) = (base.id, s1.id, s2.id);
        model.attach(base, None, mode).unwrap();
        model.attach(s1, Some(b), mode).unwrap();
        model.attach(s2, Some(m), mode).unwrap();
        (model, b, m, t)
    }

    #[test]
    fn test_attach_builds_linear_chain() {
        let (model, base, s1, s2) = three_layer_chain(BackingMode::Absolute);
        assert_eq!(model.active(), Some(s2));
        assert_eq!(model.depth(), 3);
        assert_eq!(model.path_from(&s2).unwrap().as_slice(), &[s2, s1, base]);
        assert_eq!(model.child_of(&base), Some(s1));
        assert_eq!(model.resolve_backing(&s1).unwrap().unwrap().id, base);
        assert!(model.resolve_backing(&base).unwrap().is_none());
        assert!(model.validate().is_empty());
    }

    #[test]
    fn test_relative_backing_path() {
        let (model, _, s1, s2) = three_layer_chain(BackingMode::Relative);
        let backing = model.get(&s2).unwrap().backing.clone().unwrap();
        assert_eq!(backing.layer, s1);
        assert_eq!(backing.display_path(), "S1.img");
        assert_eq!(backing.mode, BackingMode::Relative);
    }

    #[test]
    fn test_relative_backing_rejected_for_block_device() {
        let mut model = ChainModel::new(ChainId::new());
        let base = Layer::new(
            LayerId::new(),
            "BASE",
            ImageFormat::Raw,
            4096,
            LayerLocation::Block("/dev/loop0".to_string()),
        );
        let base_id = base.id;
        model.attach(base, None, BackingMode::Absolute).unwrap();
        let s1 = file_layer("S1", ImageFormat::Qcow2, 4096);
        let err = model.attach(s1, Some(base_id), BackingMode::Relative).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert_eq!(model.depth(), 1);
    }

    #[test]
    fn test_attach_size_error() {
        let mut model = ChainModel::new(ChainId::new());
        let base = file_layer("BASE", ImageFormat::Qcow2, 1024);
        let base_id = base.id;
        model.attach(base, None, BackingMode::Absolute).unwrap();
        let big = file_layer("S1", ImageFormat::Qcow2, 2048);
        match model.attach(big, Some(base_id), BackingMode::Absolute) {
            Err(Error::Size {
                backing_size,
                required,
                ..
            }) => {
                assert_eq!(backing_size, 1024);
                assert_eq!(required, 2048);
            }
            other => panic!("expected size error, got {:?}", other),
        }
    }

    #[test]
    fn test_raw_layer_cannot_have_backing() {
        let mut model = ChainModel::new(ChainId::new());
        let base = file_layer("BASE", ImageFormat::Raw, 4096);
        let base_id = base.id;
        model.attach(base, None, BackingMode::Absolute).unwrap();
        let raw = file_layer("S1", ImageFormat::Raw, 4096);
        assert!(matches!(
            model.attach(raw, Some(base_id), BackingMode::Absolute),
            Err(Error::Format { .. })
        ));
    }

    #[test]
    fn test_attach_requires_active_backing() {
        let (mut model, base, _, _) = three_layer_chain(BackingMode::Absolute);
        let s3 = file_layer("S3", ImageFormat::Qcow2, 4096);
        assert!(matches!(
            model.attach(s3.clone(), Some(base), BackingMode::Absolute),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            model.attach(s3, None, BackingMode::Absolute),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_relink_onto_descendant_is_cycle() {
        let (mut model, base, _, s2) = three_layer_chain(BackingMode::Absolute);
        let before = model.snapshot();
        assert!(matches!(
            model.relink(&base, Some(s2), BackingMode::Absolute),
            Err(Error::Cycle { .. })
        ));
        assert!(matches!(
            model.relink(&s2, Some(s2), BackingMode::Absolute),
            Err(Error::Cycle { .. })
        ));
        assert_eq!(model.snapshot(), before);
    }

    #[test]
    fn test_relink_stages_skipped_layers() {
        let (mut model, base, s1, s2) = three_layer_chain(BackingMode::Absolute);
        let staged = model.relink(&s2, Some(base), BackingMode::Absolute).unwrap();
        assert_eq!(staged, vec![s1]);
        assert_eq!(model.get(&s1).unwrap().status, LayerStatus::RemovalPending);
        assert_eq!(model.path_from(&s2).unwrap().as_slice(), &[s2, base]);
        assert!(model.validate().is_empty());

        let staged = model.relink(&s2, None, BackingMode::Absolute).unwrap();
        assert_eq!(staged, vec![base]);
        assert_eq!(model.depth(), 1);
        assert!(model.validate().is_empty());
    }

    #[test]
    fn test_detach_active_layer_rejected() {
        let (mut model, _, _, s2) = three_layer_chain(BackingMode::Absolute);
        assert!(matches!(
            model.detach(&s2),
            Err(Error::ActiveLayer { .. })
        ));
    }

    #[test]
    fn test_detach_in_use_rejected() {
        let (mut model, _, s1, _) = three_layer_chain(BackingMode::Absolute);
        assert!(matches!(model.detach(&s1), Err(Error::LayerInUse { .. })));
    }

    #[test]
    fn test_detach_pending_in_removal_order() {
        let (mut model, base, s1, s2) = three_layer_chain(BackingMode::Absolute);
        model.relink(&s2, None, BackingMode::Absolute).unwrap();

        // S1 still references BASE, so BASE has to wait
        assert!(matches!(model.detach(&base), Err(Error::LayerInUse { .. })));
        let order = model.removal_order();
        assert_eq!(order, vec![s1, base]);
        for id in order {
            model.detach(&id).unwrap();
        }
        assert_eq!(model.len(), 1);
        assert!(model.validate().is_empty());
    }

    #[test]
    fn test_validate_reports_dangling_and_multiple_active() {
        let base = file_layer("BASE", ImageFormat::Qcow2, 4096);
        let mut s1 = file_layer("S1", ImageFormat::Qcow2, 4096);
        let ghost = LayerId::new();
        s1.backing = Some(BackingRef {
            layer: ghost,
            mode: BackingMode::Absolute,
            path: "/images/GHOST.img".to_string(),
            format: ImageFormat::Qcow2,
        });
        let s1_id = s1.id;
        let model = ChainModel::from_layers(ChainId::new(), vec![base, s1]);
        let violations = model.validate();
        assert!(violations.contains(&Violation::DanglingBacking {
            layer: s1_id,
            backing: ghost
        }));
        assert!(violations
            .iter()
            .any(|v| matches!(v, Violation::MultipleActive { layers } if layers.len() == 2)));
    }

    #[test]
    fn test_validate_reports_cycle_once() {
        let mut a = file_layer("A", ImageFormat::Qcow2, 4096);
        let mut b = file_layer("B", ImageFormat::Qcow2, 4096);
        a.backing = Some(backing_ref(&a.location, &b, BackingMode::Absolute).unwrap());
        b.backing = Some(backing_ref(&b.location, &a, BackingMode::Absolute).unwrap());
        let smallest = a.id.min(b.id);
        let model = ChainModel::from_layers(ChainId::new(), vec![a.clone(), b]);

        let violations = model.validate();
        let cycles: Vec<_> = violations
            .iter()
            .filter(|v| matches!(v, Violation::Cycle { .. }))
            .collect();
        assert_eq!(cycles, vec![&Violation::Cycle { layer: smallest }]);
        assert!(violations.contains(&Violation::NoActive));
        assert!(matches!(model.path_from(&a.id), Err(Error::Cycle { .. })));
    }

    #[test]
    fn test_empty_chain_has_no_active() {
        let model = ChainModel::new(ChainId::new());
        assert_eq!(model.validate(), vec![Violation::NoActive]);
        assert!(model.require_active().is_err());
    }
}
