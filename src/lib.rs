#![doc = include_str!("../README.md")]

// Supporting modules
pub mod context;
pub mod env;
pub mod shadow;
pub mod source;

// The term algebra and its semantics
pub mod core;
pub mod surface;

// The constraint solver
pub mod solver;

// Diagnostics
pub mod reporting;

/// Interned strings.
pub type StringId = string_interner::symbol::SymbolU16;

/// String interner.
pub type StringInterner = string_interner::StringInterner<
    string_interner::backend::BucketBackend<StringId>,
    std::hash::BuildHasherDefault<fxhash::FxHasher32>,
>;
