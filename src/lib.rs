#[macro_use]
extern crate num_derive;

pub mod consts;
pub mod debugger;
pub mod kernel;
pub mod memory;
