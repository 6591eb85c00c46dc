// See <https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html>

pub mod coalescing;
pub mod degradation;
pub mod fetch;
pub mod utils;

pub use utils::*;
