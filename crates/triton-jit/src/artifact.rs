//! Compiled kernel binaries on disk.

use std::path::{Path, PathBuf};

use crate::backend::spec::{KernelError, KernelResult};

/// Extensions probed for a kernel binary, primary first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinaryFormat {
    pub primary: &'static str,
    pub fallbacks: &'static [&'static str],
}

impl BinaryFormat {
    pub const fn new(primary: &'static str, fallbacks: &'static [&'static str]) -> Self {
        Self { primary, fallbacks }
    }

    pub fn extensions(&self) -> impl Iterator<Item = &'static str> + '_ {
        std::iter::once(self.primary).chain(self.fallbacks.iter().copied())
    }
}

/// A kernel binary read fully into memory.
#[derive(Debug, Clone)]
pub struct KernelBinary {
    pub path: PathBuf,
    pub bytes: Vec<u8>,
}

impl KernelBinary {
    /// First existing `<dir>/<kernel>.<ext>` in probe order.
    pub fn locate(dir: &Path, kernel_name: &str, format: &BinaryFormat) -> KernelResult<PathBuf> {
        format
            .extensions()
            .map(|ext| dir.join(format!("{kernel_name}.{ext}")))
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| KernelError::NotFound {
                what: "kernel binary",
                path: dir.join(format!("{kernel_name}.{}", format.primary)),
            })
    }

    pub fn read(dir: &Path, kernel_name: &str, format: &BinaryFormat) -> KernelResult<Self> {
        let path = Self::locate(dir, kernel_name, format)?;
        let bytes = std::fs::read(&path).map_err(|err| KernelError::io(&path, err))?;
        if bytes.is_empty() {
            return Err(KernelError::InvalidArtifact {
                path,
                reason: "binary is empty".to_string(),
            });
        }
        Ok(Self { path, bytes })
    }

    pub fn extension(&self) -> Option<&str> {
        self.path.extension().and_then(|ext| ext.to_str())
    }
}
