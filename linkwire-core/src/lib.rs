#![doc = include_str!("../README.md")]
#![forbid(unsafe_op_in_unsafe_fn)]

mod dispatch;
mod error;
pub mod value;
mod wire;

pub use dispatch::*;
pub use error::*;
pub use value::*;
pub use wire::*;
