pub mod certificate;
pub mod classify;
pub mod error;
pub mod probe;
pub mod request;
pub mod result;
pub mod timing;
pub mod transport;
pub mod verifier;

#[cfg(test)]
pub(crate) mod testing;

pub mod prelude {
    pub use super::error::{CheckError, FailureCode, ProbeFailure};
    pub use super::probe::{EngineSettings, ProbeEngine};
    pub use super::request::{CheckOptions, CheckRequest};
    pub use super::result::{CertificateInfo, CheckResult, CheckStatus, PhaseTiming};
}

use std::fmt::Write;

/// Renders an error together with every underlying cause, one per paragraph.
pub(crate) fn report(mut err: &(dyn std::error::Error + 'static)) -> String {
    let mut s = format!("{}", err);
    while let Some(src) = err.source() {
        let _ = write!(s, "\n\nCaused by: {}", src);
        err = src;
    }
    s
}
