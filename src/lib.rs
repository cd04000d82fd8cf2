//! A content-hash build freshness log.
//!
//! Build systems that compare mtimes rebuild too much: touching a file, or
//! checking it out again, changes its mtime without changing its content.
//! This crate records, per build output, the content hashes of the inputs
//! that produced it, in a persistent append-only log that survives crashes
//! mid-write, and answers "is this output still up to date?" while reading
//! as few files as possible.
//!
//! The owning build engine supplies the dependency graph ([`graph`]), stat
//! and read access to files ([`fs`]), and drives [`db::HashLog`]: check
//! `hashes_are_clean` before running a build, call `record_hashes` after.

pub mod db;
mod densemap;
pub mod fs;
pub mod graph;
pub mod hash;
pub mod trace;
