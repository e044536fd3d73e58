//! Configuration — YAML loading, env-var secret resolution, resolved types.
//!
//! Split in the usual three layers:
//! - **raw** — serde targets mirroring the YAML shape, with defaults.
//! - **types** — the resolved, validated structs the rest of the crate uses.
//! - **load** — file reading, raw→resolved conversion, `*_env` indirection.

mod load;
mod raw;
mod types;

pub use load::{load, load_from};
pub use types::*;
