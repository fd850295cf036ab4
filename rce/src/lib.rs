//! RCE: range-check elimination for counted loops
//!
//! Proves array bounds checks in loops redundant, replaces them with pre-loop
//! guards that deoptimize on failure, and fuses two-sided range tests into
//! single unsigned compares, without changing which inputs throw.

pub mod check;
pub mod config;
pub mod deopt;
pub mod error;
pub mod fusion;
pub mod hoist;
pub mod interp;
pub mod ir;
pub mod lexer;
pub mod loops;
pub mod opt;
pub mod parser;
pub mod prover;
pub mod range;

pub use config::RceConfig;
pub use error::{RceError, Result};
pub use ir::{Method, MethodBuilder};
pub use opt::{compile, Compilation, CompiledMethod, Pipeline};
pub use prover::Verdict;
pub use range::{IntRange, Width};
pub use lexer::Span;
