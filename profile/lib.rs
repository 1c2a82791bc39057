#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]
pub mod aggregate;
pub mod config;
pub mod diagnostics;
pub mod io;
pub mod nnls;
pub mod pipeline;
pub mod report;
pub mod sampling;
pub mod select;
pub mod solver;
pub mod types;
pub mod variance;
