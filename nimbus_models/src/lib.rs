#[macro_use]
extern crate serde_derive;

extern crate serde;

pub mod models;
