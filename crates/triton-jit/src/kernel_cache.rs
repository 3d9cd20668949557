use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use log::debug;

use crate::backend::spec::{KernelError, KernelResult};
use crate::metadata::KernelMetadata;
use crate::profiling;
use crate::signature::TypePolicy;

/// Identifies one compiled artifact on disk.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KernelKey {
    directory: PathBuf,
    kernel_name: String,
}

impl KernelKey {
    pub fn new(directory: impl Into<PathBuf>, kernel_name: impl Into<String>) -> Self {
        Self {
            directory: directory.into(),
            kernel_name: kernel_name.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn kernel_name(&self) -> &str {
        &self.kernel_name
    }
}

impl fmt::Display for KernelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.directory.display(), self.kernel_name)
    }
}

/// A loaded module, the function resolved from it and its metadata.
#[derive(Debug)]
pub struct ModuleCacheEntry<M, F> {
    pub module: M,
    pub function: F,
    pub metadata: Arc<KernelMetadata>,
}

/// Insert-once map from [`KernelKey`] to loaded modules, owned by a backend.
///
/// One mutex guards the whole map and is held across the load of a missing
/// key, so every key is physically loaded at most once and loads for one
/// backend are totally ordered.
pub struct ModuleCache<M, F> {
    name: &'static str,
    entries: Mutex<HashMap<KernelKey, Arc<ModuleCacheEntry<M, F>>>>,
}

impl<M, F> ModuleCache<M, F> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &KernelKey) -> KernelResult<Option<Arc<ModuleCacheEntry<M, F>>>> {
        Ok(lock_named(&self.entries, self.name)?.get(key).cloned())
    }

    /// Returns the cached entry for `key`, running `load` under the cache lock on a miss.
    ///
    /// A failed load leaves no entry behind.
    pub fn get_or_load<L>(&self, key: &KernelKey, load: L) -> KernelResult<Arc<ModuleCacheEntry<M, F>>>
    where
        L: FnOnce() -> KernelResult<ModuleCacheEntry<M, F>>,
    {
        let mut entries = lock_named(&self.entries, self.name)?;
        if let Some(found) = entries.get(key) {
            profiling::cache_event("module_hit");
            return Ok(Arc::clone(found));
        }
        profiling::cache_event("module_miss");

        let loaded = {
            let _load_scope = profiling::compile_scope("module_load");
            Arc::new(load()?)
        };
        match entries.entry(key.clone()) {
            Entry::Occupied(_) => Err(KernelError::CacheInvariantViolation {
                cache: self.name,
                key: key.to_string(),
            }),
            Entry::Vacant(slot) => {
                debug!("{} cache: loaded {key}", self.name);
                slot.insert(Arc::clone(&loaded));
                Ok(loaded)
            }
        }
    }

    /// Cached metadata for `key`, or a fresh read of its side-car file.
    pub fn metadata_or_load(
        &self,
        key: &KernelKey,
        policy: TypePolicy,
    ) -> KernelResult<Arc<KernelMetadata>> {
        if let Some(entry) = self.get(key)? {
            return Ok(Arc::clone(&entry.metadata));
        }
        KernelMetadata::load(key.directory(), key.kernel_name(), policy).map(Arc::new)
    }

    pub fn len(&self) -> KernelResult<usize> {
        Ok(lock_named(&self.entries, self.name)?.len())
    }

    pub fn is_empty(&self) -> KernelResult<bool> {
        Ok(self.len()? == 0)
    }

    pub fn contains(&self, key: &KernelKey) -> KernelResult<bool> {
        Ok(lock_named(&self.entries, self.name)?.contains_key(key))
    }
}

impl<M, F> fmt::Debug for ModuleCache<M, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let len = self.entries.lock().map(|entries| entries.len()).ok();
        f.debug_struct("ModuleCache")
            .field("name", &self.name)
            .field("entries", &len)
            .finish()
    }
}

/// Locks `mutex`, mapping poisoning to [`KernelError::LockPoisoned`].
pub fn lock_named<'a, T>(mutex: &'a Mutex<T>, name: &'static str) -> KernelResult<MutexGuard<'a, T>> {
    mutex.lock().map_err(|_| KernelError::LockPoisoned(name))
}
