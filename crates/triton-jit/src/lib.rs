//! Kernel-launch runtime for Triton-compiled kernels.
//!
//! The crate owns everything between a caller's dynamically typed argument
//! list and a vendor driver call: the argument buffer, the textual signature
//! codec, side-car metadata loading, the per-backend module cache and the
//! JIT facade that resolves and launches overloads. Concrete devices live in
//! the `triton-jit-backend-*` crates, which implement [`Backend`].

pub mod artifact;
pub mod backend;
pub mod buffer;
pub mod compiler;
pub mod env;
pub mod jit;
pub mod kernel_cache;
pub mod metadata;
pub mod profiling;
pub mod signature;

pub use artifact::{BinaryFormat, KernelBinary};
pub use backend::spec::{
    Backend, Dim3, KernelArgs, KernelError, KernelResult, LaunchRequest, ReservedField,
};
pub use buffer::ArgumentBuffer;
pub use compiler::{CompileRequest, KernelCompiler, LaunchConfig, SubprocessCompiler};
pub use jit::{
    pack_arguments, ArgType, ArgValue, DType, JitFunction, JitRegistry, KernelHandle,
    PackedCall, StaticSignature, TensorArg,
};
pub use kernel_cache::{KernelKey, ModuleCache, ModuleCacheEntry};
pub use metadata::KernelMetadata;
pub use signature::{parse_signature, parse_signature_with, ArgDescriptor, ArgKind, TypePolicy};
