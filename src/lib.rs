//! Edge shield: gates requests in front of a web application with bypass
//! tokens, an IP blacklist, attack signature scanning, proof-of-work
//! challenges and per-IP rate limiting.

pub mod audit;
pub mod config;
pub mod core;
pub mod monitor;
pub mod server;
pub mod service;
pub mod utils;

pub use service::{Collaborators, GatingPipeline, Verdict};
