//! Request-rewriting proxy chain.
//!
//! Each stage is a loopback HTTP/1.1 listener (`server`) that hands eligible JSON bodies to a
//! `RequestRewriter` and streams everything else to its upstream (`forward`). `chain` wires
//! stages so the client only ever sees the outermost one.

pub mod chain;
pub mod effort;
pub mod forward;
pub mod http;
pub mod reasoning;
pub mod server;
pub mod trace;

pub use chain::{Passthrough, ProxyChain, StageSpec};
pub use effort::{EffortLevel, EffortMap};
pub use reasoning::{ReasoningRewriter, RequestRecord, Totals, INTROSPECTION_PATH};
pub use server::{ProxyOptions, RequestRewriter, Rewrite, RewritingProxy};
