//! This crate defines [structs for the on-disk crash context format](format/index.html)
//! used by related crates.
//!
//! You probably don't want to use this crate directly, the [dwfctx][dwfctx] crate provides
//! the actual functionality of reading and writing context files using the structs defined
//! in this crate.
//!
//! [dwfctx]: https://crates.io/crates/dwfctx

pub mod format;
