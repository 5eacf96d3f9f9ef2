//! MergeEngine: the public facade
//!
//! Owns the device registry, every chain's state and the job coordinator.
//! Layers are addressed by name; names are unique across the engine.
//!
//! Structural changes (creating, relinking, detaching and growing layers)
//! take the chain lease and are refused with `Conflict` while a merge job
//! holds the chain. Growing the active layer is the exception: it is allowed
//! during a pull, which then copies up to the new end.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use livemerge_concurrency::{poll_until, CancelToken, ChainLease, ChainLeases, WaitOptions};
use livemerge_core::{
    BackingMode, BackingRef, ChainId, Error, ImageFormat, JobId, LayerId, MergeDirection, Result,
    DEFAULT_IMAGE_SIZE,
};
use livemerge_storage::{BlockAllocationMap, DeviceKind, DeviceRegistry};
use serde::Serialize;
use tracing::{info, warn};

use crate::chain::{ChainSnapshot, Layer, LayerStatus, Violation};
use crate::config::EngineConfig;
use crate::coordinator::{CoordinatorMetrics, JobCoordinator};
use crate::job::{BlockJobInfo, JobHandle, JobSnapshot, MergeRequest};
use crate::state::ChainState;
use crate::verify::{find_mismatch, ConsistencyVerifier, Mismatch, PatternMismatch};

/// Parameters for a new layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerSpec {
    /// Image name; file-backed images are stored as `NAME.img`
    pub name: String,
    /// Image format
    pub format: ImageFormat,
    /// Size in bytes; defaults to the backing layer's size, or 100 MiB
    pub size: Option<u64>,
    /// Name of the backing layer
    pub backing: Option<String>,
    /// How the backing reference is stored
    pub backing_mode: BackingMode,
    /// Format the backing layer is expected to have
    pub backing_format: Option<ImageFormat>,
    /// Storage kind
    pub kind: DeviceKind,
}

impl LayerSpec {
    /// A standalone file-backed layer
    pub fn new(name: impl Into<String>, format: ImageFormat) -> Self {
        Self {
            name: name.into(),
            format,
            size: None,
            backing: None,
            backing_mode: BackingMode::Absolute,
            backing_format: None,
            kind: DeviceKind::File,
        }
    }

    /// Set the size in bytes
    pub fn size(mut self, bytes: u64) -> Self {
        self.size = Some(bytes);
        self
    }

    /// Back the layer onto `name`
    pub fn backed_by(mut self, name: impl Into<String>, mode: BackingMode) -> Self {
        self.backing = Some(name.into());
        self.backing_mode = mode;
        self
    }

    /// Require the backing layer to have `format`
    pub fn backing_format(mut self, format: ImageFormat) -> Self {
        self.backing_format = Some(format);
        self
    }

    /// Set the storage kind
    pub fn kind(mut self, kind: DeviceKind) -> Self {
        self.kind = kind;
        self
    }
}

/// Structured image inspection result
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LayerInfo {
    /// Chain the layer belongs to
    pub chain: ChainId,
    /// Image name
    pub name: String,
    /// Declared format
    pub format: ImageFormat,
    /// Declared size in bytes
    pub size: u64,
    /// Stored backing reference
    pub backing: Option<BackingRef>,
    /// Name of the backing layer
    pub backing_name: Option<String>,
    /// Absolute location of the image
    pub location: String,
    /// Membership in the chain
    pub status: LayerStatus,
    /// One past the highest allocated byte
    pub allocated_end: u64,
}

/// Allocation high-water mark of a chain's active layer at one instant
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainGrowthSample {
    /// When the sample was taken
    pub at: DateTime<Utc>,
    /// Sampled chain
    pub chain: ChainId,
    /// Active layer name
    pub layer: String,
    /// Declared size of the active layer
    pub size: u64,
    /// One past the highest allocated byte of the active layer
    pub allocated_end: u64,
}

/// Live-merge engine over any number of chains
pub struct MergeEngine {
    // Declared first so job workers are joined before anything else drops
    coordinator: JobCoordinator,
    chains: DashMap<ChainId, Arc<ChainState>>,
    names: DashMap<String, (ChainId, LayerId)>,
    leases: Arc<ChainLeases>,
    registry: Arc<DeviceRegistry>,
    config: EngineConfig,
}

impl MergeEngine {
    /// Open an engine storing images under `image_dir`
    ///
    /// Reads `livemerge.toml` from the directory if present.
    pub fn open(image_dir: impl AsRef<Path>) -> Result<Self> {
        let config = EngineConfig::load_or_default(image_dir.as_ref())?;
        Self::with_config(image_dir, config)
    }

    /// Open an engine with an explicit configuration
    pub fn with_config(image_dir: impl AsRef<Path>, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(DeviceRegistry::new(image_dir)?);
        Self::with_registry(config, registry)
    }

    /// Build an engine on top of an existing registry
    pub fn with_registry(config: EngineConfig, registry: Arc<DeviceRegistry>) -> Result<Self> {
        config.validate()?;
        let leases = Arc::new(ChainLeases::new());
        info!(
            target: "livemerge::coordinator",
            image_dir = %registry.image_dir().display(),
            block_size = config.block_size,
            "Merge engine opened"
        );
        Ok(Self {
            coordinator: JobCoordinator::new(&config, Arc::clone(&leases)),
            chains: DashMap::new(),
            names: DashMap::new(),
            leases,
            registry,
            config,
        })
    }

    /// Active configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Registry holding every layer's storage
    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    // ========================================================================
    // Chains and layers
    // ========================================================================

    /// Create an empty chain
    pub fn create_chain(&self) -> ChainId {
        let id = ChainId::new();
        let state = ChainState::new(id, self.config.block_size, Arc::clone(&self.registry));
        self.chains.insert(id, Arc::new(state));
        info!(target: "livemerge::chain", chain = %id, "Created chain");
        id
    }

    /// Shared state of `chain`
    pub fn chain_state(&self, chain: ChainId) -> Result<Arc<ChainState>> {
        self.chains
            .get(&chain)
            .map(|s| Arc::clone(s.value()))
            .ok_or(Error::UnknownChain(chain))
    }

    /// Chain and identity of the layer called `name`
    pub fn lookup(&self, name: &str) -> Result<(ChainId, LayerId)> {
        self.names
            .get(name)
            .map(|e| *e.value())
            .ok_or_else(|| Error::UnknownLayer(name.to_string()))
    }

    /// Identity of the layer called `name`
    pub fn layer_id(&self, name: &str) -> Result<LayerId> {
        Ok(self.lookup(name)?.1)
    }

    fn layer_in(&self, chain: ChainId, name: &str) -> Result<LayerId> {
        let (owner, id) = self.lookup(name)?;
        if owner != chain {
            return Err(Error::InvalidInput(format!(
                "{} belongs to chain {}, not {}",
                name, owner, chain
            )));
        }
        Ok(id)
    }

    /// Take the chain lease for a structural change
    fn exclusive(&self, chain: ChainId) -> Result<(ChainLease, Arc<ChainState>)> {
        let state = self.chain_state(chain)?;
        let lease = self.leases.acquire(chain);
        if let Some(job) = self.coordinator.active_job(chain) {
            return Err(Error::Conflict { chain, job });
        }
        Ok((lease, state))
    }

    /// Provision and attach a new layer on top of `chain`
    pub fn create_layer(&self, chain: ChainId, spec: LayerSpec) -> Result<LayerId> {
        let (_lease, state) = self.exclusive(chain)?;
        if self.names.contains_key(&spec.name) {
            return Err(Error::InvalidInput(format!(
                "a layer named '{}' already exists",
                spec.name
            )));
        }
        if spec.kind == DeviceKind::Block
            && spec.backing.is_some()
            && spec.backing_mode == BackingMode::Relative
        {
            return Err(Error::InvalidInput(format!(
                "{}: relative backing paths are not supported on block devices",
                spec.name
            )));
        }

        let backing = match &spec.backing {
            Some(name) => Some(self.layer_in(chain, name)?),
            None => None,
        };
        let size = {
            let model = state.model.read();
            match backing {
                Some(b) => {
                    let parent = model.layer(&b)?;
                    if let Some(expected) = spec.backing_format {
                        if expected != parent.format {
                            return Err(Error::Format {
                                layer: spec.name.clone(),
                                reason: format!(
                                    "backing {} is {}, not {}",
                                    parent.name, parent.format, expected
                                ),
                            });
                        }
                    }
                    spec.size.unwrap_or(parent.size)
                }
                None => spec.size.unwrap_or(DEFAULT_IMAGE_SIZE),
            }
        };
        if size == 0 {
            return Err(Error::InvalidInput(format!("{}: image size cannot be zero", spec.name)));
        }

        let id = LayerId::new();
        let device = self.registry.provision(id, &spec.name, spec.kind, size)?;
        let layer = Layer::new(id, spec.name.clone(), spec.format, size, device.location().clone());
        let map = match spec.format {
            ImageFormat::Raw => BlockAllocationMap::dense(self.config.block_size, size),
            ImageFormat::Qcow2 => BlockAllocationMap::sparse(self.config.block_size, size),
        };

        if let Err(e) = attach_new(&state, layer, map, backing, spec.backing_mode) {
            if let Err(cleanup) = self.registry.remove(&id) {
                warn!(target: "livemerge::device", layer = %spec.name, error = %cleanup, "Failed to release storage of rejected layer");
            }
            return Err(e);
        }
        self.names.insert(spec.name.clone(), (chain, id));
        info!(
            target: "livemerge::chain",
            chain = %chain,
            layer = %spec.name,
            format = %spec.format,
            size,
            backing = spec.backing.as_deref().unwrap_or("-"),
            "Created layer"
        );
        Ok(id)
    }

    /// Point an existing member at another layer further down its path
    ///
    /// `backing = None` makes the layer standalone. Returns the names of the
    /// layers staged for removal by the relink.
    pub fn attach(
        &self,
        chain: ChainId,
        layer: &str,
        backing: Option<&str>,
        mode: BackingMode,
    ) -> Result<Vec<String>> {
        let (_lease, state) = self.exclusive(chain)?;
        let id = self.layer_in(chain, layer)?;
        let backing = backing.map(|b| self.layer_in(chain, b)).transpose()?;
        let mut model = state.model.write();
        let mut next = model.clone();
        let staged = next.relink(&id, backing, mode)?;
        let names = staged
            .iter()
            .filter_map(|s| next.get(s).map(|l| l.name.clone()))
            .collect();
        *model = next;
        Ok(names)
    }

    /// Remove a layer from its chain and release its storage
    pub fn detach(&self, chain: ChainId, layer: &str) -> Result<()> {
        let (_lease, state) = self.exclusive(chain)?;
        let id = self.layer_in(chain, layer)?;
        self.detach_locked(&state, &id)
    }

    fn detach_locked(&self, state: &ChainState, id: &LayerId) -> Result<()> {
        let removed = {
            let mut model = state.model.write();
            let removed = model.detach(id)?;
            state.alloc.write().remove(id);
            removed
        };
        self.names.remove(&removed.name);
        self.registry.remove(id)?;
        info!(target: "livemerge::chain", chain = %state.id(), layer = %removed.name, "Removed layer");
        Ok(())
    }

    /// Detach every layer pending removal; returns their names
    pub fn detach_removed(&self, chain: ChainId) -> Result<Vec<String>> {
        let (_lease, state) = self.exclusive(chain)?;
        let order = state.model.read().removal_order();
        let mut removed = Vec::with_capacity(order.len());
        for id in order {
            let name = state.model.read().get(&id).map(|l| l.name.clone());
            if let Some(name) = name {
                self.detach_locked(&state, &id)?;
                removed.push(name);
            }
        }
        Ok(removed)
    }

    /// Grow the active layer (and every smaller member) to `new_size`
    ///
    /// Allowed while a pull runs; refused with `Conflict` during a commit.
    pub fn grow_active(&self, chain: ChainId, new_size: u64) -> Result<()> {
        let state = self.chain_state(chain)?;
        let _lease = self.leases.acquire(chain);
        if let Some(job) = self.coordinator.active_job(chain) {
            if self.coordinator.poll(job)?.direction == MergeDirection::Commit {
                return Err(Error::Conflict { chain, job });
            }
        }

        let mut model = state.model.write();
        let active = model.require_active()?;
        let current = model.layer(&active)?.size;
        if new_size < current {
            return Err(Error::InvalidInput(format!(
                "cannot shrink the active layer from {} to {} bytes",
                current, new_size
            )));
        }
        let targets: Vec<LayerId> = model
            .members()
            .filter(|l| l.size < new_size)
            .map(|l| l.id)
            .collect();
        let mut alloc = state.alloc.write();
        for id in &targets {
            self.registry.resize(id, new_size)?;
            alloc.map_mut(id)?.resize(new_size);
            model.set_size(id, new_size)?;
        }
        info!(
            target: "livemerge::chain",
            chain = %chain,
            from = current,
            to = new_size,
            resized = targets.len(),
            "Grew active layer"
        );
        Ok(())
    }

    // ========================================================================
    // Data path
    // ========================================================================

    /// Write into the chain's active layer
    pub fn write(&self, chain: ChainId, offset: u64, data: &[u8]) -> Result<()> {
        self.chain_state(chain)?.write(offset, data)
    }

    /// Fill `len` bytes at `offset` of the active layer with `pattern`
    pub fn write_pattern(&self, chain: ChainId, offset: u64, len: u64, pattern: u8) -> Result<()> {
        let state = self.chain_state(chain)?;
        let active = state.model().require_active()?;
        let data = pattern_buffer(&state, &active, offset, len, pattern)?;
        state.write(offset, &data)
    }

    /// Fill a range of a named layer that nothing backs onto yet
    pub fn write_layer_pattern(&self, layer: &str, offset: u64, len: u64, pattern: u8) -> Result<()> {
        let (chain, id) = self.lookup(layer)?;
        let state = self.chain_state(chain)?;
        let data = pattern_buffer(&state, &id, offset, len, pattern)?;
        state.write_layer(&id, offset, &data)
    }

    /// Logical content of the chain's active layer
    pub fn read(&self, chain: ChainId, offset: u64, len: u64) -> Result<Vec<u8>> {
        self.chain_state(chain)?.read(offset, len)
    }

    /// Logical content as seen through a named layer
    pub fn read_layer(&self, layer: &str, offset: u64, len: u64) -> Result<Vec<u8>> {
        let (chain, id) = self.lookup(layer)?;
        self.chain_state(chain)?.read_layer(&id, offset, len)
    }

    /// First byte of the active layer's range that is not `pattern`
    pub fn verify_pattern(
        &self,
        chain: ChainId,
        offset: u64,
        len: u64,
        pattern: u8,
    ) -> Result<Option<PatternMismatch>> {
        let data = self.read(chain, offset, len)?;
        Ok(find_mismatch(&data, offset, pattern))
    }

    /// First byte of a named layer's range that is not `pattern`
    pub fn verify_layer_pattern(
        &self,
        layer: &str,
        offset: u64,
        len: u64,
        pattern: u8,
    ) -> Result<Option<PatternMismatch>> {
        let data = self.read_layer(layer, offset, len)?;
        Ok(find_mismatch(&data, offset, pattern))
    }

    // ========================================================================
    // Merge jobs
    // ========================================================================

    /// Submit a merge job
    pub fn submit(&self, chain: ChainId, request: MergeRequest) -> Result<JobHandle> {
        let state = self.chain_state(chain)?;
        self.coordinator.submit(&state, request)
    }

    /// Forward merge into the active layer, keeping `base` (if any)
    pub fn pull(&self, chain: ChainId, base: Option<&str>, bandwidth: Option<u64>) -> Result<JobHandle> {
        let base = base.map(|b| self.layer_id(b)).transpose()?;
        let mut request = MergeRequest::pull(base);
        request.bandwidth = bandwidth;
        self.submit(chain, request)
    }

    /// Backward merge of `(base, top]` into `base`; `top` defaults to active
    pub fn commit(
        &self,
        chain: ChainId,
        base: &str,
        top: Option<&str>,
        bandwidth: Option<u64>,
    ) -> Result<JobHandle> {
        let base = self.layer_id(base)?;
        let top = top.map(|t| self.layer_id(t)).transpose()?;
        let mut request = MergeRequest::commit(base, top);
        request.bandwidth = bandwidth;
        self.submit(chain, request)
    }

    /// Current state of a job
    pub fn poll(&self, job: JobId) -> Result<JobSnapshot> {
        self.coordinator.poll(job)
    }

    /// Ask a job to stop at its next chunk boundary
    pub fn cancel(&self, job: JobId) -> Result<()> {
        self.coordinator.cancel(job)
    }

    /// Wait for a job's worker to exit
    pub fn join(&self, job: JobId) -> Result<JobSnapshot> {
        self.coordinator.join(job)
    }

    /// Every retained job
    pub fn jobs(&self) -> Vec<JobSnapshot> {
        self.coordinator.jobs()
    }

    /// Coordinator counters
    pub fn metrics(&self) -> CoordinatorMetrics {
        self.coordinator.metrics()
    }

    /// Block-job status of `chain`, or None when no job is outstanding
    pub fn block_job_info(&self, chain: ChainId) -> Result<Option<BlockJobInfo>> {
        self.chain_state(chain)?;
        Ok(self.coordinator.block_job_info(chain))
    }

    /// Wait parameters from the configuration
    pub fn wait_options(&self) -> WaitOptions {
        self.config.wait_options()
    }

    /// Poll until the chain has no outstanding job or its cursor reached the end
    ///
    /// A job reporting a different direction is a hard failure
    /// (`InvalidInput`); running out of time is `Timeout`.
    pub fn wait_block_job(
        &self,
        chain: ChainId,
        direction: MergeDirection,
        opts: &WaitOptions,
        cancel: Option<&CancelToken>,
    ) -> Result<()> {
        let what = format!("{} job on chain {}", direction, chain);
        poll_until(&what, opts, cancel, || match self.block_job_info(chain)? {
            None => Ok(Some(())),
            Some(info) if info.direction != direction => Err(Error::InvalidInput(format!(
                "block job on chain {} is a {}, expected {}",
                chain, info.direction, direction
            ))),
            Some(info) if info.cursor == info.end => Ok(Some(())),
            Some(_) => Ok(None),
        })
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    /// Structured description of a named layer
    pub fn inspect(&self, layer: &str) -> Result<LayerInfo> {
        let (chain, id) = self.lookup(layer)?;
        let state = self.chain_state(chain)?;
        let model = state.model();
        let l = model.layer(&id)?;
        let backing_name = model.resolve_backing(&id).ok().flatten().map(|b| b.name.clone());
        Ok(LayerInfo {
            chain,
            name: l.name.clone(),
            format: l.format,
            size: l.size,
            backing: l.backing.clone(),
            backing_name,
            location: l.location.absolute(),
            status: l.status,
            allocated_end: state.allocated_end(&id)?,
        })
    }

    /// [`inspect`](Self::inspect) rendered as JSON
    pub fn inspect_json(&self, layer: &str) -> Result<String> {
        let info = self.inspect(layer)?;
        serde_json::to_string_pretty(&info)
            .map_err(|e| Error::Internal(format!("failed to render layer info: {}", e)))
    }

    /// Name of the chain's active layer
    pub fn active_layer(&self, chain: ChainId) -> Result<String> {
        let state = self.chain_state(chain)?;
        let model = state.model();
        let active = model.require_active()?;
        Ok(model.layer(&active)?.name.clone())
    }

    /// Member names from the active layer down to the base
    pub fn backing_chain(&self, chain: ChainId) -> Result<Vec<String>> {
        let state = self.chain_state(chain)?;
        let model = state.model();
        model
            .active_path()?
            .iter()
            .map(|id| Ok(model.layer(id)?.name.clone()))
            .collect()
    }

    /// Allocation high-water mark of the active layer, timestamped
    pub fn sample_growth(&self, chain: ChainId) -> Result<ChainGrowthSample> {
        let state = self.chain_state(chain)?;
        let model = state.model();
        let active = model.require_active()?;
        let l = model.layer(&active)?;
        Ok(ChainGrowthSample {
            at: Utc::now(),
            chain,
            layer: l.name.clone(),
            size: l.size,
            allocated_end: state.allocated_end(&active)?,
        })
    }

    /// Backing structure of every layer in `chain`
    pub fn snapshot(&self, chain: ChainId) -> Result<ChainSnapshot> {
        Ok(self.chain_state(chain)?.snapshot())
    }

    /// Structural violations of `chain`
    pub fn validate(&self, chain: ChainId) -> Result<Vec<Violation>> {
        Ok(self.chain_state(chain)?.validate())
    }

    /// Check the stored backing reference of a named layer
    pub fn check_backing(
        &self,
        layer: &str,
        expected: Option<&str>,
        mode: BackingMode,
    ) -> Result<Option<Mismatch>> {
        let (chain, id) = self.lookup(layer)?;
        let expected = expected
            .map(|name| self.layer_in(chain, name).map(|b| (b, mode)))
            .transpose()?;
        let state = self.chain_state(chain)?;
        ConsistencyVerifier::new(&state).check_backing(&id, expected)
    }

    /// Check the declared format of a named layer
    pub fn check_format(&self, layer: &str, expected: ImageFormat) -> Result<Option<Mismatch>> {
        let (chain, id) = self.lookup(layer)?;
        let state = self.chain_state(chain)?;
        ConsistencyVerifier::new(&state).check_format(&id, expected)
    }

    /// Cancel every job and wait for the workers
    pub fn shutdown(&self) {
        self.coordinator.shutdown();
    }
}

/// Bounds-checked pattern fill; the range is checked before allocating
fn pattern_buffer(state: &ChainState, layer: &LayerId, offset: u64, len: u64, pattern: u8) -> Result<Vec<u8>> {
    state.check_range(layer, offset, len)?;
    let len = usize::try_from(len)
        .map_err(|_| Error::InvalidInput(format!("{} bytes do not fit in memory", len)))?;
    Ok(vec![pattern; len])
}

fn attach_new(
    state: &ChainState,
    layer: Layer,
    map: BlockAllocationMap,
    backing: Option<LayerId>,
    mode: BackingMode,
) -> Result<()> {
    let id = layer.id;
    let mut model = state.model.write();
    state.alloc.write().insert(id, map)?;
    if let Err(e) = model.attach(layer, backing, mode) {
        state.alloc.write().remove(&id);
        return Err(e);
    }
    Ok(())
}

impl Drop for MergeEngine {
    fn drop(&mut self) {
        self.coordinator.shutdown();
    }
}

impl std::fmt::Debug for MergeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeEngine")
            .field("image_dir", &self.registry.image_dir())
            .field("chains", &self.chains.len())
            .field("layers", &self.names.len())
            .finish()
    }
}
