//! oxiscr - A multi-level checkpoint/restart cache for bulk-synchronous
//! parallel applications.
//!
//! Checkpoint files are written to fast node-local storage, protected there
//! by a user-selectable redundancy scheme, and migrated to the parallel
//! file system in the background. On restart the library reconstructs the
//! most recent usable checkpoint from surviving node-local copies instead
//! of re-reading the file system, tolerating node failures up to the
//! scheme's limit:
//!
//! - **LOCAL**: cache only, no cross-node protection
//! - **PARTNER**: full copy of each rank's files on a partner node
//! - **XOR**: reduce-scatter parity across small sets of nodes
//!
//! # Quick start
//!
//! ```rust,ignore
//! use oxiscr::{LocalComm, Params, Scr};
//!
//! let mut scr = Scr::init(comm, params)?;
//! loop {
//!     // ... compute ...
//!     if scr.need_checkpoint()? {
//!         scr.start_checkpoint()?;
//!         let path = scr.route_file("rank_0.ckpt".as_ref())?;
//!         std::fs::write(&path, state)?;
//!         scr.complete_checkpoint(true)?;
//!     }
//! }
//! scr.finalize()?;
//! ```

#![warn(missing_docs)]
#![allow(dead_code)]

pub mod cache;
pub mod comm;
pub mod config;
pub mod descriptor;
pub mod distribute;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod fileio;
pub mod filemap;
pub mod flush;
pub mod halt;
pub mod index;
pub mod kvtree;
pub mod meta;
pub mod redundancy;
pub mod summary;

// Re-exports for convenience
pub use comm::local::LocalComm;
pub use comm::Comm;
pub use config::Params;
pub use descriptor::CopyType;
pub use engine::Scr;
pub use error::{Error, Result};
pub use flush::mover::Mover;

/// Prelude module for common imports
pub mod prelude {
    pub use crate::comm::local::LocalComm;
    pub use crate::comm::Comm;
    pub use crate::config::Params;
    pub use crate::descriptor::CopyType;
    pub use crate::engine::Scr;
    pub use crate::error::{Error, Result};
}
