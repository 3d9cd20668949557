pub mod compat;
pub mod spec;
