#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]
#![deny(missing_debug_implementations, nonstandard_style)]
#![warn(unreachable_pub)]

#[macro_use]
extern crate serde_derive;

extern crate serde;
extern crate serde_json;

#[cfg(doctest)]
mod doctests {
    doc_comment::doctest!("../README.md");
}

pub use nimbus_models::models;

pub mod affinity;
pub mod builder;
pub mod config;
pub mod disk;
pub mod history;
mod lease;
pub mod network;
pub mod parser;
pub mod pool;
pub mod vm;
