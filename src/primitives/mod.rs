//! Low-level building blocks of the VFS layer.
//!
//! Includes the borrowed memory-region view that backs the main database and
//! the operating-system file I/O used by the default provider.

/// Positioned file I/O on real files.
pub mod io;

/// Bounds-checked views over application-supplied memory.
///
/// Turns a numeric address from an open request into a lifetime-bound view.
pub mod region;
