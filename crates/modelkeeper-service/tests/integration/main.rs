// See <https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html>

pub mod artifacts;
pub mod models;
pub mod persistence;
pub mod services;
pub mod utils;

pub use utils::*;
