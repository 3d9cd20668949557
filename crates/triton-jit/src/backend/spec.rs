use std::ffi::c_void;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use smallvec::SmallVec;
use thiserror::Error;

use crate::buffer::ArgumentBuffer;
use crate::metadata::KernelMetadata;
use crate::signature::{ArgDescriptor, ArgKind};

/// Errors surfaced by kernel loading, argument marshalling and launches.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error("{what} not found: {}", path.display())]
    NotFound { what: &'static str, path: PathBuf },
    #[error("invalid kernel artifact {}: {reason}", path.display())]
    InvalidArtifact { path: PathBuf, reason: String },
    #[error("invalid kernel metadata {path}: {source}")]
    InvalidMetadata {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(
        "compute architecture mismatch: device has sm_{device}, kernel requires sm_{kernel}"
    )]
    ArchitectureMismatch { device: u32, kernel: u32 },
    #[error(
        "out of resources: requested shared memory ({requested} bytes) exceeds the device maximum ({available} bytes)"
    )]
    ResourceExceeded { requested: u32, available: u32 },
    #[error("unsupported argument type '{token}'")]
    UnsupportedType { token: String },
    #[error("{op} failed with code {code}: {message}")]
    Driver {
        op: &'static str,
        code: i32,
        message: String,
    },
    #[error("{cache} cache already holds an entry for {key}")]
    CacheInvariantViolation { cache: &'static str, key: String },
    #[error("invalid kernel argument: {0}")]
    InvalidArgument(String),
    #[error("kernel compiler failed: {0}")]
    Compiler(String),
    #[error("{0} mutex poisoned")]
    LockPoisoned(&'static str),
    #[error("{backend} runtime unavailable: {reason}")]
    Unavailable {
        backend: &'static str,
        reason: String,
    },
}

impl KernelError {
    pub fn driver(op: &'static str, code: i32, message: impl Into<String>) -> Self {
        KernelError::Driver {
            op,
            code,
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        KernelError::InvalidArgument(message.into())
    }

    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        KernelError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Convenience alias for results returned by runtime routines.
pub type KernelResult<T> = Result<T, KernelError>;

/// Three-dimensional grid or block extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Dim3 {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl Dim3 {
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    pub const fn linear(x: u32) -> Self {
        Self { x, y: 1, z: 1 }
    }

    /// Total number of groups, or `None` when the product overflows `u32`.
    pub fn volume(&self) -> Option<u32> {
        self.x.checked_mul(self.y)?.checked_mul(self.z)
    }
}

impl Default for Dim3 {
    fn default() -> Self {
        Self::linear(1)
    }
}

impl fmt::Display for Dim3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{},{})", self.x, self.y, self.z)
    }
}

/// A system-reserved slot a backend places ahead of user arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservedField {
    pub name: &'static str,
    pub kind: ArgKind,
}

impl ReservedField {
    pub const fn pointer(name: &'static str) -> Self {
        Self {
            name,
            kind: ArgKind::Pointer,
        }
    }
}

#[derive(Clone, Copy)]
enum ArgsRepr<'a> {
    Packed(&'a ArgumentBuffer),
    Raw(&'a [*mut c_void]),
}

/// Borrowed view of the per-argument values handed to a launch.
///
/// Either a packed [`ArgumentBuffer`] (the normal path) or a raw array of
/// argument pointers supplied by a caller that marshalled its own values.
#[derive(Clone, Copy)]
pub struct KernelArgs<'a> {
    repr: ArgsRepr<'a>,
}

impl<'a> KernelArgs<'a> {
    pub fn packed(buffer: &'a ArgumentBuffer) -> Self {
        Self {
            repr: ArgsRepr::Packed(buffer),
        }
    }

    /// Wraps a caller-built array of argument pointers.
    ///
    /// # Safety
    ///
    /// Every non-null pointer must reference a live, readable value at least as
    /// large as the descriptor the backend reads it with (at most 8 bytes), and
    /// must stay valid until the launch returns.
    pub unsafe fn from_raw(pointers: &'a [*mut c_void]) -> Self {
        Self {
            repr: ArgsRepr::Raw(pointers),
        }
    }

    pub fn len(&self) -> usize {
        match self.repr {
            ArgsRepr::Packed(buffer) => buffer.arg_count(),
            ArgsRepr::Raw(pointers) => pointers.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One pointer per argument, in push order.
    pub fn pointers(&self) -> SmallVec<[*mut c_void; 16]> {
        match self.repr {
            ArgsRepr::Packed(buffer) => buffer
                .ptrs()
                .into_iter()
                .map(|ptr| ptr as *mut c_void)
                .collect(),
            ArgsRepr::Raw(pointers) => pointers.iter().copied().collect(),
        }
    }

    /// Copies the first `size` bytes of argument `index`, zero-extended to 8.
    ///
    /// Returns `None` for out-of-range indices and null raw pointers.
    pub fn read(&self, index: usize, size: usize) -> Option<[u8; 8]> {
        let size = size.min(8);
        let mut out = [0u8; 8];
        match self.repr {
            ArgsRepr::Packed(buffer) => {
                let slot = buffer.slot(index)?;
                let len = slot.len().min(size);
                out[..len].copy_from_slice(&slot[..len]);
            }
            ArgsRepr::Raw(pointers) => {
                let ptr = *pointers.get(index)?;
                if ptr.is_null() {
                    return None;
                }
                // SAFETY: `from_raw` requires non-null pointers to reference at least
                // `size` readable bytes for the duration of the launch.
                unsafe {
                    std::ptr::copy_nonoverlapping(ptr as *const u8, out.as_mut_ptr(), size);
                }
            }
        }
        Some(out)
    }
}

impl fmt::Debug for KernelArgs<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.repr {
            ArgsRepr::Packed(_) => "packed",
            ArgsRepr::Raw(_) => "raw",
        };
        f.debug_struct("KernelArgs")
            .field("kind", &kind)
            .field("len", &self.len())
            .finish()
    }
}

/// Everything a backend needs to issue one launch.
#[derive(Debug)]
pub struct LaunchRequest<'a, K> {
    pub kernel: &'a K,
    pub grid: Dim3,
    pub block: Dim3,
    pub shared_memory_bytes: u32,
    pub args: KernelArgs<'a>,
    /// Full textual signature, for backends that derive their own layout.
    pub signature: Option<&'a str>,
    /// Pre-parsed layout from kernel metadata; wins over `signature`.
    pub arg_layout: Option<&'a [ArgDescriptor]>,
}

/// Capability set every compute backend implements.
///
/// A backend value owns its module cache and is shared by every facade that
/// launches through it, so one cache exists per backend for the lifetime of
/// the backend object.
pub trait Backend: Send + Sync + 'static {
    type Stream: Copy + Send + Sync + fmt::Debug;
    type Context: Copy + Send + Sync + fmt::Debug;
    type Kernel: Clone + Send + Sync + fmt::Debug;

    /// Human-readable backend identifier (e.g. `"cuda"`, `"npu"`).
    const NAME: &'static str;
    const VERSION: &'static str;
    /// Threads per scheduling group; 1 for devices without warps.
    const WARP_SIZE: u32;
    /// System fields the backend writes ahead of user arguments.
    const RESERVED_HEADER: &'static [ReservedField] = &[];

    /// Returns true when launches should carry the metadata `arg_layout`.
    fn wants_arg_layout(&self) -> bool {
        false
    }

    /// Validates the current device context, creating a default one if absent.
    fn ensure_context(&self) -> KernelResult<Self::Context>;

    /// Index of the device bound to the current context.
    fn device_index(&self) -> KernelResult<i32>;

    /// Loads (or returns the cached) kernel `kernel_name` from `dir`.
    fn load_kernel(&self, dir: &Path, kernel_name: &str) -> KernelResult<Self::Kernel>;

    /// Shared memory declared by the kernel's metadata, 0 when absent.
    fn shared_memory(&self, dir: &Path, kernel_name: &str) -> KernelResult<u32>;

    /// Metadata of an already loaded kernel.
    fn kernel_metadata(
        &self,
        dir: &Path,
        kernel_name: &str,
    ) -> KernelResult<Option<Arc<KernelMetadata>>>;

    fn launch(
        &self,
        stream: Self::Stream,
        request: LaunchRequest<'_, Self::Kernel>,
    ) -> KernelResult<()>;
}
