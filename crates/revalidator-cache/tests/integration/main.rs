// See <https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html>

pub mod fetching;
pub mod invalidation;
pub mod mutations;
pub mod utils;

pub use utils::*;
