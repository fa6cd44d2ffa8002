//! The process-wide registry of active devices, used by diagnostics to
//! find a device by name. Readers take the shared lock; registration and
//! teardown are rare writers.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};

use crate::error::{Result, VdoError};
use crate::vdo::Vdo;

pub type DeviceHandle = Arc<Mutex<Vdo>>;

static REGISTRY: Lazy<RwLock<HashMap<String, Weak<Mutex<Vdo>>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

pub fn register(name: &str, handle: &DeviceHandle) -> Result<()> {
    let mut registry = REGISTRY.write();
    if let Some(existing) = registry.get(name) {
        if existing.strong_count() > 0 {
            return Err(VdoError::DeviceExists(name.to_string()));
        }
    }
    registry.insert(name.to_string(), Arc::downgrade(handle));
    Ok(())
}

pub fn deregister(name: &str) {
    REGISTRY.write().remove(name);
}

pub fn lookup(name: &str) -> Option<DeviceHandle> {
    REGISTRY.read().get(name)?.upgrade()
}

pub fn registered_names() -> Vec<String> {
    REGISTRY
        .read()
        .iter()
        .filter(|(_, weak)| weak.strong_count() > 0)
        .map(|(name, _)| name.clone())
        .collect()
}
