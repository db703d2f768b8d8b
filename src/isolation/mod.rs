//! Isolation layer: namespace descriptors
//!
//! Namespace handles are plain descriptors on `/proc/<tid>/ns/*` or bound
//! netns files; scoped entry guards restore the caller's namespace on
//! every exit path.

pub mod namespace;

pub use namespace::{NamespaceHandle, NamespaceSet, NetnsGuard, NsKind};
