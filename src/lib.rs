//! pullgate - pull-through registry middleware
//!
//! A container image registry facade that sits in front of a local
//! content-addressed store and transparently fetches manifests and blobs
//! from the upstream registries referenced by the repository's image
//! stream. Reads that hit the local store are served as-is; misses are
//! resolved through the cluster's image catalog, fetched over the right
//! transport with the right policy, and optionally mirrored back locally.
//!
//! The entry point is [`server::App`]: configure it with a catalog client,
//! the local store halves and a pull-through policy, then open a
//! [`server::Repository`] per request and use its manifest and blob
//! pipelines.

pub mod catalog;
pub mod image;
pub mod registry;
pub mod server;
pub mod store;

pub use image::{Digest, ImageReference, Manifest};
pub use server::{App, Error, PullthroughConfig, Repository, RequestContext};
