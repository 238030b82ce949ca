// See <https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html>

pub mod cache;
pub mod http;
pub mod polling;
pub mod utils;

pub use utils::*;
