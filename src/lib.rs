//! `varnish-core-rs`: the request lifecycle engine of an HTTP reverse-proxy
//! cache — the per-request state machine, the object cache (objhead/
//! objcore/object graph), the worker pool, storage stevedores, the fetch
//! pipeline (gzip/ESI), the expiry binheap, and the ban list.
//!
//! See `SPEC_FULL.md` for the module-to-component mapping and `DESIGN.md`
//! for the grounding ledger. The VCL compiler, the management process,
//! on-disk persistence, the varnishlog/-stat/-top tools, the replay
//! harness, and vmod loading are out of scope and have no corresponding
//! module here.

pub mod backend;
pub mod cache;
pub mod cli;
pub mod debug;
pub mod deliver;
pub mod error;
pub mod fetch;
pub mod http;
pub mod lock;
pub mod params;
pub mod policy;
pub mod session;
pub mod state;
pub mod stats;
pub mod storage;
pub mod worker;
pub mod workspace;
