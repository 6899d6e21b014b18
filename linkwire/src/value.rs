//! Target types for the shallow coercion applied to user-command payloads.
//!
//! User commands carry only a leaf's raw bytes on the wire (see
//! `linkwire_core::value::shallow`); this module re-exports the structured
//! [`Value`] tree for callers who build payloads programmatically and adds
//! the small target-type enum `on()` registrations use to pick a coercion.

pub use linkwire_core::Value;

/// Target type a user-command parameter may request coercion to.
///
/// Mirrors `linkwire_core::value::shallow::Target`; kept as a distinct type
/// in this crate so the public client/server API doesn't leak the core
/// crate's internal module path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Bytes,
    Text,
    Int,
}

impl From<Target> for linkwire_core::value::shallow::Target {
    fn from(target: Target) -> Self {
        match target {
            Target::Bytes => linkwire_core::value::shallow::Target::Bytes,
            Target::Text => linkwire_core::value::shallow::Target::Text,
            Target::Int => linkwire_core::value::shallow::Target::Int,
        }
    }
}
