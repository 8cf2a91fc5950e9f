//! Utility modules for the edge shield.
//! This module contains common utilities used across the application.

mod error;
mod logging;

pub use logging::{
    init_logging,
    create_request_span,
    log_rate_limit,
    log_waf_match,
    log_verdict,
};

pub use error::{ShieldError, ShieldResult};
