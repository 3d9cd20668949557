//! Side-car kernel metadata (`<dir>/<kernel>.json`).

use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::backend::spec::{KernelError, KernelResult};
use crate::signature::{parse_layout_type, ArgDescriptor, TypePolicy};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KernelMetadata {
    pub shared_memory_bytes: u32,
    pub target_arch: Option<u32>,
    pub mix_mode: Option<String>,
    /// Authoritative runtime layout when present; never empty.
    pub arg_layout: Option<Vec<ArgDescriptor>>,
}

#[derive(Debug, Default, Deserialize)]
struct RawMetadata {
    #[serde(default)]
    shared: Option<u32>,
    #[serde(default)]
    target: Option<RawTarget>,
    #[serde(default)]
    arch: Option<RawArch>,
    #[serde(default)]
    mix_mode: Option<String>,
    #[serde(default)]
    arg_layout: Option<Vec<RawArg>>,
}

#[derive(Debug, Default, Deserialize)]
struct RawTarget {
    #[serde(default)]
    arch: Option<RawArch>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawArch {
    Number(u32),
    Name(String),
}

#[derive(Debug, Deserialize)]
struct RawArg {
    #[serde(rename = "type", default)]
    ty: Option<String>,
}

impl RawArch {
    fn resolve(&self) -> Option<u32> {
        match self {
            RawArch::Number(value) => Some(*value),
            RawArch::Name(name) => {
                let trimmed = name.trim();
                let digits = trimmed.strip_prefix("sm_").unwrap_or(trimmed);
                digits.parse().ok()
            }
        }
    }
}

pub fn metadata_path(dir: &Path, kernel_name: &str) -> PathBuf {
    dir.join(format!("{kernel_name}.json"))
}

impl KernelMetadata {
    /// Parses a metadata document; `origin` names it in error messages.
    pub fn from_json_str(text: &str, origin: &str, policy: TypePolicy) -> KernelResult<Self> {
        let raw: RawMetadata =
            serde_json::from_str(text).map_err(|source| KernelError::InvalidMetadata {
                path: origin.to_string(),
                source,
            })?;

        let target_arch = raw
            .target
            .and_then(|target| target.arch)
            .or(raw.arch)
            .and_then(|arch| arch.resolve());

        let arg_layout = match raw.arg_layout {
            Some(entries) => {
                let mut layout = Vec::with_capacity(entries.len());
                for ty in entries.into_iter().filter_map(|entry| entry.ty) {
                    if let Some(descriptor) = parse_layout_type(&ty, policy)? {
                        layout.push(descriptor);
                    }
                }
                Some(layout).filter(|layout| !layout.is_empty())
            }
            None => None,
        };

        Ok(Self {
            shared_memory_bytes: raw.shared.unwrap_or(0),
            target_arch,
            mix_mode: raw.mix_mode,
            arg_layout,
        })
    }

    /// Reads `<dir>/<kernel>.json`; a missing file yields the defaults.
    pub fn load(dir: &Path, kernel_name: &str, policy: TypePolicy) -> KernelResult<Self> {
        let path = metadata_path(dir, kernel_name);
        match std::fs::read_to_string(&path) {
            Ok(text) => Self::from_json_str(&text, &path.display().to_string(), policy),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(KernelError::io(path, err)),
        }
    }

    pub fn has_arg_layout(&self) -> bool {
        self.arg_layout.is_some()
    }
}
