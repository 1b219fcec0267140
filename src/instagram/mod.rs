//! Instagram platform adapter: session, private API, enrichment, bootstrap.

pub mod api;
pub mod bootstrap;
pub mod enricher;
pub mod media;
pub mod session;
