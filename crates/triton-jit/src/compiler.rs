//! The external compiler collaborator.

use std::path::{Path, PathBuf};
use std::process::Command;

use log::{debug, info};

use crate::backend::spec::{Dim3, KernelError, KernelResult};
use crate::env;
use crate::jit::StaticSignature;
use crate::profiling;

/// Grid and tuning knobs for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchConfig {
    pub grid: Dim3,
    pub num_warps: u32,
    pub num_stages: u32,
}

impl LaunchConfig {
    pub fn new(grid: Dim3, num_warps: u32, num_stages: u32) -> Self {
        Self {
            grid,
            num_warps,
            num_stages,
        }
    }
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self::new(Dim3::default(), 4, 3)
    }
}

/// One compile job: a function specialized to a full textual signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileRequest<'a> {
    pub file_path: &'a Path,
    pub function_name: &'a str,
    pub signature: &'a str,
    pub num_warps: u32,
    pub num_stages: u32,
    pub device_index: i32,
}

/// Turns kernel sources into on-disk artifacts. Both calls may block for seconds.
pub trait KernelCompiler: Send + Sync {
    fn extract_signature(&self, file_path: &Path, function_name: &str)
        -> KernelResult<StaticSignature>;

    /// Compiles and returns the directory holding `<function>.<ext>` and its metadata.
    fn compile(&self, request: &CompileRequest<'_>) -> KernelResult<PathBuf>;
}

/// Runs an external program with `signature` and `compile` subcommands.
#[derive(Debug, Clone)]
pub struct SubprocessCompiler {
    program: String,
    cache_dir: PathBuf,
}

impl SubprocessCompiler {
    pub fn new(program: impl Into<String>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            cache_dir: cache_dir.into(),
        }
    }

    /// Program from `TRITON_JIT_COMPILER`, cache from `TRITON_JIT_CACHE_DIR`.
    pub fn from_env() -> Self {
        Self::new(env::compiler_program(), env::cache_dir())
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    fn run(&self, command: &mut Command, what: &str) -> KernelResult<String> {
        let output = command.output().map_err(|err| {
            KernelError::Compiler(format!("failed to run {}: {err}", self.program))
        })?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(KernelError::Compiler(format!(
                "{} {what} failed (status={}): stdout='{}' stderr='{}'",
                self.program,
                output.status,
                stdout.trim(),
                stderr.trim()
            )));
        }
        Ok(stdout.into_owned())
    }
}

impl KernelCompiler for SubprocessCompiler {
    fn extract_signature(
        &self,
        file_path: &Path,
        function_name: &str,
    ) -> KernelResult<StaticSignature> {
        let stdout = self.run(
            Command::new(&self.program)
                .arg("signature")
                .arg("--file")
                .arg(file_path)
                .arg("--function")
                .arg(function_name),
            "signature",
        )?;
        let codes: Vec<i64> = serde_json::from_str(stdout.trim()).map_err(|err| {
            KernelError::Compiler(format!(
                "{} signature printed malformed output '{}': {err}",
                self.program,
                stdout.trim()
            ))
        })?;
        debug!("static signature of {function_name}: {codes:?}");
        Ok(StaticSignature::from_codes(&codes))
    }

    fn compile(&self, request: &CompileRequest<'_>) -> KernelResult<PathBuf> {
        std::fs::create_dir_all(&self.cache_dir)
            .map_err(|err| KernelError::io(&self.cache_dir, err))?;
        let _compile_scope = profiling::compile_scope("compiler.subprocess");
        info!(
            "compiling {}::{} for signature '{}' on device {}",
            request.file_path.display(),
            request.function_name,
            request.signature,
            request.device_index
        );
        let stdout = self.run(
            Command::new(&self.program)
                .arg("compile")
                .arg("--file")
                .arg(request.file_path)
                .arg("--function")
                .arg(request.function_name)
                .arg("--signature")
                .arg(request.signature)
                .arg("--num-warps")
                .arg(request.num_warps.to_string())
                .arg("--num-stages")
                .arg(request.num_stages.to_string())
                .arg("--device")
                .arg(request.device_index.to_string())
                .arg("--cache-dir")
                .arg(&self.cache_dir),
            "compile",
        )?;
        let dir = stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .last()
            .ok_or_else(|| {
                KernelError::Compiler(format!("{} compile printed no directory", self.program))
            })?;
        Ok(PathBuf::from(dir))
    }
}
