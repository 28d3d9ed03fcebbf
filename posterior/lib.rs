#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]
pub mod config;
pub mod data;
pub mod estimate;
pub mod importance;
pub mod interval;
pub mod model;
pub mod output;
pub mod transform;
pub mod types;
