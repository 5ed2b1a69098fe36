//! Architecture-specific state: registers, segments, exception vectors and page tables.

pub mod x86;
