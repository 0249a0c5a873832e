//! Trip progress resolution
//!
//! Pure functions: no I/O, no clocks. Callers pass the reference time.

mod dedupe;
mod resolver;

pub use dedupe::{extend_tracked, new_stop_codes};
pub use resolver::{StopHistory, resolve_stop_history};
