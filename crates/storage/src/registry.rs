//! Session-scoped registry of provisioned layer storage
//!
//! The registry is the provisioning collaborator of the merge engine: it
//! creates, resizes and removes the storage behind each layer and hands out
//! `Arc<dyn BlockDevice>` handles. It is an explicit context object, scoped
//! to one session, and tears down everything it created when dropped.
//!
//! ## Naming
//!
//! A layer called `NAME` is stored at `<image_dir>/NAME.img` when file
//! backed. Block-device layers get the next free `/dev/loopN` identifier and
//! live in memory.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let registry = DeviceRegistry::new(dir.path())?;
//! let base = registry.provision(LayerId::new(), "BASE", DeviceKind::File, 100 << 20)?;
//! base.write_at(0, &[1u8; 3072])?;
//! registry.teardown();
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use livemerge_core::{BlockDevice, Error, LayerId, LayerLocation, Result};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use crate::file::FileDevice;
use crate::memory::MemoryDevice;

/// Kind of storage behind a layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    /// Regular image file in the registry's image directory
    File,
    /// Block device node (memory backed)
    Block,
}

struct RegisteredDevice {
    name: String,
    kind: DeviceKind,
    device: Arc<dyn BlockDevice>,
    memory: Option<Arc<MemoryDevice>>,
}

/// Registry of provisioned devices, keyed by layer
pub struct DeviceRegistry {
    image_dir: PathBuf,
    created_dir: bool,
    devices: RwLock<FxHashMap<LayerId, RegisteredDevice>>,
    next_loop: AtomicU32,
    torn_down: AtomicBool,
}

impl DeviceRegistry {
    /// Create a registry storing image files under `image_dir`
    ///
    /// The directory is created if missing, and removed again on teardown
    /// when this registry created it.
    pub fn new(image_dir: impl AsRef<Path>) -> Result<Self> {
        let image_dir = image_dir.as_ref().to_path_buf();
        let created_dir = !image_dir.exists();
        fs::create_dir_all(&image_dir).map_err(|e| Error::io(0, e))?;
        let image_dir = fs::canonicalize(&image_dir).map_err(|e| Error::io(0, e))?;
        Ok(Self {
            image_dir,
            created_dir,
            devices: RwLock::new(FxHashMap::default()),
            next_loop: AtomicU32::new(0),
            torn_down: AtomicBool::new(false),
        })
    }

    /// Directory holding file-backed images
    pub fn image_dir(&self) -> &Path {
        &self.image_dir
    }

    /// Absolute path a file-backed layer called `name` is stored at
    pub fn image_path(&self, name: &str) -> PathBuf {
        self.image_dir.join(format!("{}.img", name))
    }

    /// Provision storage of `size` bytes for `layer`
    pub fn provision(
        &self,
        layer: LayerId,
        name: &str,
        kind: DeviceKind,
        size: u64,
    ) -> Result<Arc<dyn BlockDevice>> {
        validate_name(name)?;
        let mut devices = self.devices.write();
        if devices.contains_key(&layer) {
            return Err(Error::InvalidInput(format!(
                "layer {} already has storage",
                layer
            )));
        }
        if devices.values().any(|d| d.name == name) {
            return Err(Error::InvalidInput(format!(
                "an image named '{}' already exists",
                name
            )));
        }

        let (device, memory): (Arc<dyn BlockDevice>, Option<Arc<MemoryDevice>>) = match kind {
            DeviceKind::File => {
                let path = self.image_path(name);
                let dev = FileDevice::create(&path, size).map_err(|e| Error::io(0, e))?;
                let shared: Arc<dyn BlockDevice> = Arc::new(dev);
                (shared, None)
            }
            DeviceKind::Block => {
                let n = self.next_loop.fetch_add(1, Ordering::Relaxed);
                let location = LayerLocation::Block(format!("/dev/loop{}", n));
                let dev = Arc::new(MemoryDevice::new(location, size));
                let shared: Arc<dyn BlockDevice> = dev.clone();
                (shared, Some(dev))
            }
        };

        info!(
            target: "livemerge::device",
            layer = %layer,
            name,
            location = %device.location(),
            size,
            "Provisioned layer storage"
        );

        devices.insert(
            layer,
            RegisteredDevice {
                name: name.to_string(),
                kind,
                device: device.clone(),
                memory,
            },
        );
        Ok(device)
    }

    /// Device handle of `layer`
    pub fn get(&self, layer: &LayerId) -> Result<Arc<dyn BlockDevice>> {
        self.devices
            .read()
            .get(layer)
            .map(|d| d.device.clone())
            .ok_or_else(|| Error::UnknownLayer(layer.to_string()))
    }

    /// Concrete memory device of a block-backed layer (for fault injection)
    pub fn memory_device(&self, layer: &LayerId) -> Option<Arc<MemoryDevice>> {
        self.devices.read().get(layer).and_then(|d| d.memory.clone())
    }

    /// Location of `layer`
    pub fn location(&self, layer: &LayerId) -> Result<LayerLocation> {
        Ok(self.get(layer)?.location().clone())
    }

    /// Storage kind of `layer`
    pub fn kind(&self, layer: &LayerId) -> Option<DeviceKind> {
        self.devices.read().get(layer).map(|d| d.kind)
    }

    /// Name `layer` was provisioned under
    pub fn name(&self, layer: &LayerId) -> Option<String> {
        self.devices.read().get(layer).map(|d| d.name.clone())
    }

    /// Grow or shrink the storage of `layer`
    pub fn resize(&self, layer: &LayerId, size: u64) -> Result<()> {
        let device = self.get(layer)?;
        device.resize(size).map_err(|e| Error::io(size, e))?;
        debug!(target: "livemerge::device", layer = %layer, size, "Resized layer storage");
        Ok(())
    }

    /// Release the storage of `layer`, deleting its image file
    pub fn remove(&self, layer: &LayerId) -> Result<()> {
        let entry = self
            .devices
            .write()
            .remove(layer)
            .ok_or_else(|| Error::UnknownLayer(layer.to_string()))?;
        release(layer, entry).map_err(|e| Error::io(0, e))
    }

    /// Release every device and delete every image file
    ///
    /// Idempotent; also runs on drop.
    pub fn teardown(&self) {
        let drained: Vec<(LayerId, RegisteredDevice)> = self.devices.write().drain().collect();
        let count = drained.len();
        for (layer, entry) in drained {
            if let Err(e) = release(&layer, entry) {
                warn!(target: "livemerge::device", layer = %layer, error = %e, "Failed to release layer storage");
            }
        }
        if self.created_dir && !self.torn_down.swap(true, Ordering::AcqRel) {
            // Only succeeds when empty; anything left behind is not ours
            if let Err(e) = fs::remove_dir(&self.image_dir) {
                warn!(
                    target: "livemerge::device",
                    dir = %self.image_dir.display(),
                    error = %e,
                    "Image directory left in place"
                );
            }
        }
        if count > 0 {
            info!(target: "livemerge::device", released = count, "Registry torn down");
        }
    }

    /// Number of provisioned layers
    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    /// Check if nothing is provisioned
    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }

    /// Every provisioned layer
    pub fn layers(&self) -> Vec<LayerId> {
        self.devices.read().keys().copied().collect()
    }
}

impl Drop for DeviceRegistry {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("image_dir", &self.image_dir)
            .field("devices", &self.len())
            .finish()
    }
}

fn release(layer: &LayerId, entry: RegisteredDevice) -> io::Result<()> {
    if let LayerLocation::File(path) = entry.device.location() {
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    debug!(target: "livemerge::device", layer = %layer, name = %entry.name, "Released layer storage");
    Ok(())
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidInput("image name cannot be empty".to_string()));
    }
    if name.contains('/') || name.contains('\0') || name == "." || name == ".." {
        return Err(Error::InvalidInput(format!(
            "image name '{}' must be a plain file stem",
            name
        )));
    }
    Ok(())
}
