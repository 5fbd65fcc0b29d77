#![recursion_limit = "256"]

pub mod data;
pub mod inference;
pub mod loader;
pub mod model;
pub mod train;
