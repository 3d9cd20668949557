//! Launch block layout for `rtKernelLaunch`.
//!
//! The runtime takes one contiguous, naturally aligned block: a system header,
//! the user arguments in layout order, then the grid extents as three `i32`s.

use log::{trace, warn};
use triton_jit::{
    ArgDescriptor, ArgumentBuffer, Dim3, KernelArgs, KernelError, KernelResult,
    ReservedField,
};

/// Header slots written ahead of user arguments; only `ffts_addr` is non-zero.
pub const SYSTEM_HEADER: [ReservedField; 3] = [
    ReservedField::pointer("ffts_addr"),
    ReservedField::pointer("sync_block_lock"),
    ReservedField::pointer("workspace_addr"),
];

/// Builds the launch block for one call.
///
/// Arguments that are missing or null are skipped rather than zero-filled.
pub fn pack_launch_block(
    ffts_addr: u64,
    layout: &[ArgDescriptor],
    args: &KernelArgs<'_>,
    grid: Dim3,
) -> KernelResult<ArgumentBuffer> {
    let mut buffer = ArgumentBuffer::with_capacity(SYSTEM_HEADER.len() + layout.len() + 3);
    for field in &SYSTEM_HEADER {
        let value = if field.name == "ffts_addr" { ffts_addr } else { 0 };
        buffer.push_reserved(field, value);
    }

    if args.len() < layout.len() {
        warn!(
            "argument layout has {} entries but only {} arguments were supplied",
            layout.len(),
            args.len()
        );
    }
    for (index, desc) in layout.iter().enumerate() {
        let Some(bytes) = args.read(index, desc.size) else {
            trace!("skipping null argument {index}");
            continue;
        };
        let offset = buffer.push_bytes(&bytes[..desc.size], desc.align);
        trace!("arg {index}: {:?} at offset {offset}", desc.kind);
    }

    for extent in [grid.x, grid.y, grid.z] {
        let extent = i32::try_from(extent).map_err(|_| {
            KernelError::invalid_argument(format!("grid extent {extent} exceeds i32"))
        })?;
        buffer.push(extent);
    }
    Ok(buffer)
}

