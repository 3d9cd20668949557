use std::fmt;

use crate::backend::spec::{KernelError, KernelResult};
use crate::buffer::{ArgScalar, ArgumentBuffer};
use crate::signature::NULLOPT_TOKEN;

use super::static_signature::{ArgType, StaticSignature};

/// Element type of a device-memory argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    Bool,
    F16,
    BF16,
    F32,
    F64,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
}

impl DType {
    /// Type name used in textual signatures (`*fp32`, `*i64`, ...).
    pub fn triton_name(self) -> &'static str {
        match self {
            DType::Bool => "i1",
            DType::F16 => "fp16",
            DType::BF16 => "bf16",
            DType::F32 => "fp32",
            DType::F64 => "fp64",
            DType::I8 => "i8",
            DType::I16 => "i16",
            DType::I32 => "i32",
            DType::I64 => "i64",
            DType::U8 => "u8",
            DType::U16 => "u16",
            DType::U32 => "u32",
            DType::U64 => "u64",
        }
    }
}

/// A device-memory argument: its data pointer and element type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TensorArg {
    pub data_ptr: u64,
    pub dtype: DType,
}

impl TensorArg {
    pub fn new(data_ptr: u64, dtype: DType) -> Self {
        Self { data_ptr, dtype }
    }

    pub fn from_ptr<T>(ptr: *const T, dtype: DType) -> Self {
        Self::new(ptr as usize as u64, dtype)
    }
}

/// One dynamically typed call-site argument.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ArgValue {
    Tensor(TensorArg),
    Bool(bool),
    I32(i32),
    I64(i64),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    /// An absent optional argument.
    None,
}

impl From<TensorArg> for ArgValue {
    fn from(value: TensorArg) -> Self {
        ArgValue::Tensor(value)
    }
}

macro_rules! impl_from_scalar {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for ArgValue {
                fn from(value: $ty) -> Self {
                    ArgValue::$variant(value)
                }
            }
        )*
    };
}

impl_from_scalar!(
    bool => Bool,
    i32 => I32,
    i64 => I64,
    u32 => U32,
    u64 => U64,
    f32 => F32,
    f64 => F64,
);

impl<T: Into<ArgValue>> From<Option<T>> for ArgValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(ArgValue::None, Into::into)
    }
}

impl fmt::Display for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgValue::Tensor(tensor) => {
                write!(f, "*{}@{:#x}", tensor.dtype.triton_name(), tensor.data_ptr)
            }
            ArgValue::Bool(v) => write!(f, "{v}"),
            ArgValue::I32(v) => write!(f, "{v}"),
            ArgValue::I64(v) => write!(f, "{v}"),
            ArgValue::U32(v) => write!(f, "{v}"),
            ArgValue::U64(v) => write!(f, "{v}"),
            ArgValue::F32(v) => write!(f, "{v:?}"),
            ArgValue::F64(v) => write!(f, "{v:?}"),
            ArgValue::None => f.write_str(NULLOPT_TOKEN),
        }
    }
}

impl ArgValue {
    fn scalar_name(&self) -> &'static str {
        match self {
            ArgValue::Bool(_) => "i1",
            ArgValue::I32(_) => "i32",
            ArgValue::I64(_) => "i64",
            ArgValue::U32(_) => "u32",
            ArgValue::U64(_) => "u64",
            ArgValue::F32(_) => "fp32",
            ArgValue::F64(_) => "fp64",
            ArgValue::Tensor(_) | ArgValue::None => "",
        }
    }

    /// Integer value for specialization; `None` for floats, tensors and absent values.
    fn as_integral(&self) -> Option<i128> {
        match *self {
            ArgValue::Bool(v) => Some(i128::from(v)),
            ArgValue::I32(v) => Some(i128::from(v)),
            ArgValue::I64(v) => Some(i128::from(v)),
            ArgValue::U32(v) => Some(i128::from(v)),
            ArgValue::U64(v) => Some(i128::from(v)),
            _ => None,
        }
    }

    fn push_to(&self, buffer: &mut ArgumentBuffer) {
        match *self {
            ArgValue::Tensor(tensor) => push(buffer, tensor.data_ptr),
            // same width as the `i1` descriptor
            ArgValue::Bool(v) => push(buffer, i32::from(v)),
            ArgValue::I32(v) => push(buffer, v),
            ArgValue::I64(v) => push(buffer, v),
            ArgValue::U32(v) => push(buffer, v),
            ArgValue::U64(v) => push(buffer, v),
            ArgValue::F32(v) => push(buffer, v),
            ArgValue::F64(v) => push(buffer, v),
            ArgValue::None => {}
        }
    }
}

fn push<T: ArgScalar>(buffer: &mut ArgumentBuffer, value: T) {
    buffer.push(value);
}

fn specialization_suffix(value: i128) -> &'static str {
    if value == 1 {
        ":1"
    } else if value % 16 == 0 {
        ":16"
    } else {
        ""
    }
}

/// Packed argument block and full textual signature for one call.
#[derive(Debug, Clone)]
pub struct PackedCall {
    pub buffer: ArgumentBuffer,
    pub signature: String,
}

/// Walks `args` against `ssig`, producing buffer bytes and signature tokens.
///
/// A null global scratch pointer is appended as the final runtime argument; it
/// has no signature token.
pub fn pack_arguments(ssig: &StaticSignature, args: &[ArgValue]) -> KernelResult<PackedCall> {
    let mut buffer = ArgumentBuffer::with_capacity(ssig.num_args() + 1);
    let mut tokens: Vec<String> = Vec::with_capacity(ssig.num_args());

    for (index, arg) in args.iter().enumerate() {
        match arg {
            ArgValue::None => tokens.push(NULLOPT_TOKEN.to_string()),
            ArgValue::Tensor(tensor) => {
                let arg_type = ssig.at(index)?;
                if arg_type == ArgType::Constexpr {
                    return Err(KernelError::invalid_argument(format!(
                        "argument {index} is a tensor but the kernel declares it constexpr"
                    )));
                }
                arg.push_to(&mut buffer);
                let suffix = if arg_type == ArgType::Specialized && tensor.data_ptr % 16 == 0 {
                    ":16"
                } else {
                    ""
                };
                tokens.push(format!("*{}{suffix}", tensor.dtype.triton_name()));
            }
            scalar => match ssig.at(index)? {
                ArgType::Constexpr => tokens.push(scalar.to_string()),
                ArgType::Specialized => match scalar.as_integral() {
                    Some(value) => {
                        let suffix = specialization_suffix(value);
                        if suffix != ":1" {
                            scalar.push_to(&mut buffer);
                        }
                        tokens.push(format!("{}{suffix}", scalar.scalar_name()));
                    }
                    None => {
                        scalar.push_to(&mut buffer);
                        tokens.push(scalar.scalar_name().to_string());
                    }
                },
                ArgType::NonConstexpr => {
                    scalar.push_to(&mut buffer);
                    tokens.push(scalar.scalar_name().to_string());
                }
            },
        }
    }

    // global scratch
    buffer.push(0u64);

    Ok(PackedCall {
        buffer,
        signature: tokens.join(","),
    })
}
