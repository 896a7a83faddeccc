#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]
pub mod config;
pub mod engine;
pub mod io;
pub mod phenotypic;
pub mod ranges;
pub mod trend;
pub mod types;

#[path = "../hd/mod.rs"]
pub mod hd;
