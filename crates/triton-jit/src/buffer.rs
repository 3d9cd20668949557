//! Alignment-aware byte buffer used to assemble launch argument blocks.

use smallvec::SmallVec;

use crate::backend::spec::ReservedField;

const ESTIMATED_BYTES_PER_ARG: usize = 8;
const WORD: usize = std::mem::size_of::<u64>();

mod sealed {
    pub trait Sealed {}
}

/// Plain scalar types that can be appended to an [`ArgumentBuffer`].
pub trait ArgScalar: Copy + sealed::Sealed {
    const SIZE: usize;
    const ALIGN: usize;

    fn write_ne(self, out: &mut [u8]);
}

macro_rules! impl_arg_scalar {
    ($($ty:ty),* $(,)?) => {
        $(
            impl sealed::Sealed for $ty {}

            impl ArgScalar for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();
                const ALIGN: usize = std::mem::align_of::<$ty>();

                fn write_ne(self, out: &mut [u8]) {
                    out.copy_from_slice(&self.to_ne_bytes());
                }
            }
        )*
    };
}

impl_arg_scalar!(i8, i16, i32, i64, u8, u16, u32, u64, f32, f64);

impl sealed::Sealed for bool {}

impl ArgScalar for bool {
    const SIZE: usize = 1;
    const ALIGN: usize = 1;

    fn write_ne(self, out: &mut [u8]) {
        out[0] = u8::from(self);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Slot {
    offset: usize,
    len: usize,
}

/// Owned, contiguous launch argument block.
///
/// Values are stored at offsets aligned to their natural alignment. Backing
/// storage is a `Vec<u64>` so the base address is always 8-byte aligned and
/// offset alignment carries over to absolute addresses. Offsets are recorded
/// per argument; pointers into the block are only produced by [`ptrs`], after
/// every push has happened.
///
/// [`ptrs`]: ArgumentBuffer::ptrs
#[derive(Debug, Clone, Default)]
pub struct ArgumentBuffer {
    words: Vec<u64>,
    cursor: usize,
    slots: SmallVec<[Slot; 16]>,
}

impl ArgumentBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer sized for roughly `num_args` scalar or pointer arguments.
    pub fn with_capacity(num_args: usize) -> Self {
        let mut buffer = Self::new();
        buffer.reserve(num_args);
        buffer
    }

    pub fn reserve(&mut self, num_args: usize) {
        let bytes = num_args.saturating_mul(ESTIMATED_BYTES_PER_ARG);
        let words = bytes.div_ceil(WORD);
        self.words.reserve(words.saturating_sub(self.words.len()));
        self.slots.reserve(num_args);
    }

    /// Appends `value` at the next offset aligned to `T::ALIGN` and returns that offset.
    pub fn push<T: ArgScalar>(&mut self, value: T) -> usize {
        let offset = self.allocate(T::SIZE, T::ALIGN);
        value.write_ne(&mut self.bytes_mut()[offset..offset + T::SIZE]);
        offset
    }

    /// Appends raw bytes aligned to `align` (a power of two, at most 8).
    pub fn push_bytes(&mut self, bytes: &[u8], align: usize) -> usize {
        let offset = self.allocate(bytes.len(), align.clamp(1, WORD));
        self.bytes_mut()[offset..offset + bytes.len()].copy_from_slice(bytes);
        offset
    }

    /// Writes a backend-reserved field, truncating `value` to the field width.
    pub fn push_reserved(&mut self, field: &ReservedField, value: u64) -> usize {
        let size = field.kind.size();
        let bytes = value.to_ne_bytes();
        let payload = if cfg!(target_endian = "little") {
            &bytes[..size]
        } else {
            &bytes[WORD - size..]
        };
        self.push_bytes(payload, field.kind.align())
    }

    /// Packed region, `byte_len()` bytes long.
    pub fn data(&self) -> &[u8] {
        &self.bytes()[..self.cursor]
    }

    pub fn byte_len(&self) -> usize {
        self.cursor
    }

    pub fn is_empty(&self) -> bool {
        self.cursor == 0
    }

    /// Number of values pushed so far.
    pub fn arg_count(&self) -> usize {
        self.slots.len()
    }

    /// Bytes of the `index`-th pushed value.
    pub fn slot(&self, index: usize) -> Option<&[u8]> {
        let slot = self.slots.get(index)?;
        Some(&self.bytes()[slot.offset..slot.offset + slot.len])
    }

    pub fn offsets(&self) -> impl Iterator<Item = usize> + '_ {
        self.slots.iter().map(|slot| slot.offset)
    }

    /// One pointer per pushed value, for array-of-pointers launch ABIs.
    ///
    /// The pointers are valid until the buffer is next mutated or dropped.
    pub fn ptrs(&self) -> SmallVec<[*const u8; 16]> {
        let base = self.words.as_ptr() as *const u8;
        self.slots
            .iter()
            // SAFETY: every slot offset lies within the initialised storage.
            .map(|slot| unsafe { base.add(slot.offset) })
            .collect()
    }

    fn allocate(&mut self, size: usize, align: usize) -> usize {
        let offset = self.cursor.next_multiple_of(align);
        let end = offset + size;
        let needed_words = end.div_ceil(WORD);
        if needed_words > self.words.len() {
            let grown = needed_words.max(self.words.len() * 2);
            self.words.resize(grown, 0);
        }
        self.cursor = end;
        self.slots.push(Slot { offset, len: size });
        offset
    }

    fn bytes(&self) -> &[u8] {
        // SAFETY: u64 storage is plain data; viewing it as bytes is always valid
        // and the length covers exactly the allocated words.
        unsafe {
            std::slice::from_raw_parts(self.words.as_ptr() as *const u8, self.words.len() * WORD)
        }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as in `bytes`; any byte pattern is a valid u64.
        unsafe {
            std::slice::from_raw_parts_mut(
                self.words.as_mut_ptr() as *mut u8,
                self.words.len() * WORD,
            )
        }
    }
}
