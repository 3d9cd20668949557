//! Call-site facade: argument walking, overload cache, kernel handles and the registry.

mod args;
mod function;
mod kernel;
mod registry;
mod static_signature;

pub use args::{pack_arguments, ArgValue, DType, PackedCall, TensorArg};
pub use function::JitFunction;
pub use kernel::KernelHandle;
pub use registry::JitRegistry;
pub use static_signature::{ArgType, StaticSignature};
