//! Host-side bindings for an embeddable guest machine: conversions, opaque
//! Rust objects, checked callbacks, and snapshots that survive restarts.
#![cfg_attr(all(docsrs, not(doctest)), feature(doc_auto_cfg))]

pub use ferry_lang::*;

#[cfg(feature = "std")]
pub use ferry_std as stdlib;
