use log::warn;

use crate::backend::spec::{KernelError, KernelResult};

/// How the compiler treats one positional parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgType {
    /// Ordinary runtime argument.
    NonConstexpr,
    /// Runtime argument whose value may select a specialized variant.
    Specialized,
    /// Compile-time constant; contributes only a signature token.
    Constexpr,
}

impl ArgType {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(ArgType::NonConstexpr),
            1 => Some(ArgType::Specialized),
            2 => Some(ArgType::Constexpr),
            _ => None,
        }
    }

    pub fn code(self) -> i64 {
        match self {
            ArgType::NonConstexpr => 0,
            ArgType::Specialized => 1,
            ArgType::Constexpr => 2,
        }
    }
}

/// Per-parameter argument types of one kernel function.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StaticSignature {
    arg_types: Vec<ArgType>,
}

impl StaticSignature {
    pub fn new(arg_types: Vec<ArgType>) -> Self {
        Self { arg_types }
    }

    /// Builds from numeric codes; unknown codes are treated as non-constexpr.
    pub fn from_codes(codes: &[i64]) -> Self {
        let arg_types = codes
            .iter()
            .map(|&code| {
                ArgType::from_code(code).unwrap_or_else(|| {
                    warn!("unknown static argument type code {code}, assuming non-constexpr");
                    ArgType::NonConstexpr
                })
            })
            .collect();
        Self { arg_types }
    }

    pub fn num_args(&self) -> usize {
        self.arg_types.len()
    }

    pub fn at(&self, index: usize) -> KernelResult<ArgType> {
        self.arg_types.get(index).copied().ok_or_else(|| {
            KernelError::invalid_argument(format!(
                "argument {index} is out of range for a kernel taking {} arguments",
                self.arg_types.len()
            ))
        })
    }

    pub fn arg_types(&self) -> &[ArgType] {
        &self.arg_types
    }
}
