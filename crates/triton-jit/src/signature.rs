//! Textual signature codec: comma-separated type tokens to runtime argument layout.

use log::warn;

use crate::backend::spec::{KernelError, KernelResult};
use crate::env;

/// Token emitted for absent optional arguments.
pub const NULLOPT_TOKEN: &str = "nullopt";

/// Structural kind of one runtime argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgKind {
    Pointer,
    Int32,
    Int64,
    Float32,
    Float64,
}

impl ArgKind {
    pub const fn size(self) -> usize {
        match self {
            ArgKind::Pointer | ArgKind::Int64 | ArgKind::Float64 => 8,
            ArgKind::Int32 | ArgKind::Float32 => 4,
        }
    }

    pub const fn align(self) -> usize {
        self.size()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArgDescriptor {
    pub kind: ArgKind,
    pub size: usize,
    pub align: usize,
}

impl ArgDescriptor {
    pub const fn new(kind: ArgKind) -> Self {
        Self {
            kind,
            size: kind.size(),
            align: kind.align(),
        }
    }
}

impl From<ArgKind> for ArgDescriptor {
    fn from(kind: ArgKind) -> Self {
        Self::new(kind)
    }
}

/// What to do with a type token nobody recognises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TypePolicy {
    /// Warn and treat the argument as a 64-bit integer.
    #[default]
    Lenient,
    /// Fail with [`KernelError::UnsupportedType`].
    Strict,
}

impl TypePolicy {
    /// `Strict` when `TRITON_JIT_STRICT_SIGNATURE` is truthy.
    pub fn from_env() -> Self {
        if env::strict_signatures() {
            TypePolicy::Strict
        } else {
            TypePolicy::Lenient
        }
    }

    fn unknown(self, token: &str, context: &str) -> KernelResult<ArgKind> {
        match self {
            TypePolicy::Lenient => {
                warn!("unknown {context} type '{token}', defaulting to i64");
                Ok(ArgKind::Int64)
            }
            TypePolicy::Strict => Err(KernelError::UnsupportedType {
                token: token.to_string(),
            }),
        }
    }
}

/// True for compile-time constant tokens: a leading digit, or `-` then a digit.
pub fn is_numeric_constant(token: &str) -> bool {
    let mut chars = token.chars();
    match chars.next() {
        Some(c) if c.is_ascii_digit() => true,
        Some('-') => chars.next().is_some_and(|c| c.is_ascii_digit()),
        _ => false,
    }
}

/// True for non-numeric constexpr literals: booleans and non-finite floats.
pub fn is_literal_constant(token: &str) -> bool {
    matches!(
        token,
        "true" | "false" | "True" | "False" | "NaN" | "nan" | "inf" | "-inf"
    )
}

/// Parses with the lenient policy; unknown tokens become `Int64`.
pub fn parse_signature(signature: &str) -> Vec<ArgDescriptor> {
    signature
        .split(',')
        .filter_map(|token| classify(token, TypePolicy::Lenient).ok().flatten())
        .collect()
}

/// Parses `signature` into the descriptors of its runtime arguments.
///
/// Constants, `nullopt` tokens and scalars specialized to `:1` (which carry no
/// bytes at the call site) are skipped.
pub fn parse_signature_with(
    signature: &str,
    policy: TypePolicy,
) -> KernelResult<Vec<ArgDescriptor>> {
    let mut layout = Vec::new();
    for token in signature.split(',') {
        if let Some(descriptor) = classify(token, policy)? {
            layout.push(descriptor);
        }
    }
    Ok(layout)
}

fn classify(token: &str, policy: TypePolicy) -> KernelResult<Option<ArgDescriptor>> {
    let token = token.trim();
    if token.is_empty()
        || token == NULLOPT_TOKEN
        || is_numeric_constant(token)
        || is_literal_constant(token)
    {
        return Ok(None);
    }
    let (ty, specialization) = match token.split_once(':') {
        Some((ty, spec)) => (ty.trim(), Some(spec.trim())),
        None => (token, None),
    };
    if ty.starts_with('*') {
        return Ok(Some(ArgDescriptor::new(ArgKind::Pointer)));
    }
    if specialization == Some("1") {
        return Ok(None);
    }
    let kind = match signature_kind(ty) {
        Some(kind) => kind,
        None => policy.unknown(ty, "signature")?,
    };
    Ok(Some(ArgDescriptor::new(kind)))
}

fn signature_kind(ty: &str) -> Option<ArgKind> {
    if ty.starts_with("i64") || ty.starts_with("u64") {
        Some(ArgKind::Int64)
    } else if ty.starts_with("i32") || ty.starts_with("u32") || ty == "i1" {
        Some(ArgKind::Int32)
    } else if ty.starts_with("fp64") || ty.starts_with("f64") {
        Some(ArgKind::Float64)
    } else if ty.starts_with("fp32") || ty.starts_with("f32") {
        Some(ArgKind::Float32)
    } else if ty.starts_with("fp16") || ty.starts_with("f16") || ty.starts_with("bf16") {
        // half precision is promoted at the call site
        Some(ArgKind::Float32)
    } else {
        None
    }
}

/// Maps an `arg_layout[].type` metadata string; `None` for `constexpr` entries.
pub fn parse_layout_type(name: &str, policy: TypePolicy) -> KernelResult<Option<ArgDescriptor>> {
    let kind = match name.trim() {
        "constexpr" => return Ok(None),
        "ptr" | "pointer" => ArgKind::Pointer,
        "i64" | "u64" => ArgKind::Int64,
        "i32" | "u32" => ArgKind::Int32,
        "fp64" | "f64" => ArgKind::Float64,
        "fp32" | "f32" => ArgKind::Float32,
        other => policy.unknown(other, "arg_layout")?,
    };
    Ok(Some(ArgDescriptor::new(kind)))
}
