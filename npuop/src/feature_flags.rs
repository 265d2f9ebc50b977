//! Information about the available feature flags
//!
//! # "acl"
//!
//! Enables `driver::AclDriver`, which binds the vendor runtime (`libascendcl.so`) at run
//! time. Nothing is linked at build time, so the feature builds on machines without the
//! toolkit; `AclDriver::new` fails with `Error::LibraryLoad` if the library can't
//! be opened.
//!
//! The library is looked up with the platform's usual search rules. Point the
//! `NPUOP_ACL_LIBRARY` environment variable at a file to load that one instead.
//!
//! Example:
//! ```toml
//! npuop = { version = "...", features = ["acl"] }
//! ```
//!
//! ```ignore
//! use npuop::prelude::*;
//! let npu = Npu::new(std::sync::Arc::new(npuop::driver::AclDriver::new(0)?));
//! ```
//!
//! `Npu::default()` runs on [crate::driver::HostDriver], a simulator executing on host
//! memory, with or without the feature.

/// Whether the vendor runtime binding was compiled in.
pub const ACL_ENABLED: bool = cfg!(feature = "acl");
