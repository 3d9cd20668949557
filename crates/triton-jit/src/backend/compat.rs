//! Device compatibility gates shared by load paths.

use super::spec::{KernelError, KernelResult};

/// Static shared memory any kernel may use without opting in.
pub const LARGE_SHARED_MEMORY_THRESHOLD: u32 = 48 * 1024;

/// How a kernel's shared memory must be configured after loading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SharedMemoryPlan {
    /// Fits the default carve-out; nothing to configure.
    Default,
    /// Needs the shared-memory-preferring cache config and a raised
    /// dynamic shared memory limit.
    PreferShared,
}

/// Exact-match architecture gate; `major * 10 + minor` on both sides.
pub fn check_arch(device_arch: u32, kernel_arch: u32) -> KernelResult<()> {
    if device_arch != kernel_arch {
        return Err(KernelError::ArchitectureMismatch {
            device: device_arch,
            kernel: kernel_arch,
        });
    }
    Ok(())
}

/// Decides the shared memory configuration for a kernel requiring `required`
/// bytes on a device whose opt-in maximum is `optin`.
pub fn plan_shared_memory(required: u32, optin: u32) -> KernelResult<SharedMemoryPlan> {
    if required > optin {
        return Err(KernelError::ResourceExceeded {
            requested: required,
            available: optin,
        });
    }
    if required > LARGE_SHARED_MEMORY_THRESHOLD && optin > LARGE_SHARED_MEMORY_THRESHOLD {
        Ok(SharedMemoryPlan::PreferShared)
    } else {
        Ok(SharedMemoryPlan::Default)
    }
}

/// Dynamic shared memory left once the kernel's static usage is reserved.
pub fn dynamic_shared_limit(optin: u32, static_bytes: u32) -> u32 {
    optin.saturating_sub(static_bytes)
}
