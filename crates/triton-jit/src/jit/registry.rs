use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::backend::spec::{Backend, KernelResult};
use crate::compiler::KernelCompiler;
use crate::kernel_cache::lock_named;

use super::function::JitFunction;

/// Caller-owned map from `(file, function)` to its single [`JitFunction`].
pub struct JitRegistry<B: Backend> {
    backend: Arc<B>,
    compiler: Arc<dyn KernelCompiler>,
    functions: Mutex<HashMap<(PathBuf, String), Arc<JitFunction<B>>>>,
}

impl<B: Backend> JitRegistry<B> {
    pub fn new(backend: Arc<B>, compiler: Arc<dyn KernelCompiler>) -> Self {
        Self {
            backend,
            compiler,
            functions: Mutex::new(HashMap::new()),
        }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Returns the facade for `(file_path, function_name)`, creating it on first lookup.
    ///
    /// Creation extracts the static signature under the registry lock, so each
    /// pair is created exactly once.
    pub fn get_or_create(
        &self,
        file_path: impl AsRef<Path>,
        function_name: &str,
    ) -> KernelResult<Arc<JitFunction<B>>> {
        let key = (file_path.as_ref().to_path_buf(), function_name.to_string());
        let mut functions = lock_named(&self.functions, "jit registry")?;
        if let Some(found) = functions.get(&key) {
            return Ok(Arc::clone(found));
        }
        let function = Arc::new(JitFunction::new(
            Arc::clone(&self.backend),
            Arc::clone(&self.compiler),
            key.0.clone(),
            function_name,
        )?);
        functions.insert(key, Arc::clone(&function));
        Ok(function)
    }

    pub fn len(&self) -> KernelResult<usize> {
        Ok(lock_named(&self.functions, "jit registry")?.len())
    }

    pub fn is_empty(&self) -> KernelResult<bool> {
        Ok(self.len()? == 0)
    }
}

impl<B: Backend> fmt::Debug for JitRegistry<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JitRegistry")
            .field("backend", &B::NAME)
            .finish_non_exhaustive()
    }
}
