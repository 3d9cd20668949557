use std::env;
use std::path::PathBuf;
use std::sync::OnceLock;

pub const COMPILER_ENV: &str = "TRITON_JIT_COMPILER";
pub const CACHE_DIR_ENV: &str = "TRITON_JIT_CACHE_DIR";
pub const STRICT_SIGNATURE_ENV: &str = "TRITON_JIT_STRICT_SIGNATURE";

const DEFAULT_COMPILER: &str = "triton-jit-compile";
const DEFAULT_CACHE_DIR: &str = ".cache/triton-jit";

static STRICT_SIGNATURE: OnceLock<bool> = OnceLock::new();

pub fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

/// First of `keys` set to a non-blank value, trimmed.
pub fn non_empty_var(keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| {
        env::var(key)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}

pub fn strict_signatures() -> bool {
    *STRICT_SIGNATURE.get_or_init(|| match env::var(STRICT_SIGNATURE_ENV) {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value),
        _ => false,
    })
}

pub fn compiler_program() -> String {
    non_empty_var(&[COMPILER_ENV]).unwrap_or_else(|| DEFAULT_COMPILER.to_string())
}

pub fn cache_dir() -> PathBuf {
    non_empty_var(&[CACHE_DIR_ENV])
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_DIR))
}
