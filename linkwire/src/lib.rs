#![doc = include_str!("../README.md")]

mod cache;
mod client;
mod control;
mod error;
mod identity;
mod keepalive;
mod registry;
mod server;
mod value;

pub use cache::*;
pub use client::*;
pub use control::{Control, ControlError, LookupReply};
pub use error::*;
pub use identity::*;
pub use keepalive::*;
pub use registry::*;
pub use server::*;
pub use value::*;
