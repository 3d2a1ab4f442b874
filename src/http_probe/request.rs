use std::time::Duration;

use http::Method;
use url::Url;

/// Hard ceiling applied to every requested timeout.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum number of redirects a probe will follow.
pub const MAX_REDIRECTS: usize = 5;

/// A single check job as handed to the probe engine.
#[derive(Debug, Clone)]
pub struct CheckRequest {
    /// Opaque reference correlating the result with the job that produced it.
    pub reference: String,

    /// HTTP method to use for the first attempt.
    pub method: Method,

    /// Target URL. Only `http` and `https` are probed.
    pub url: Url,

    /// Requested timeout for the whole request/response cycle.
    pub timeout: Duration,

    pub options: CheckOptions,
}

/// Per-check policy flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckOptions {
    /// Retry a failed HEAD request once as an independent GET request.
    pub get_fallback: bool,

    /// Continue with the request even if the presented certificate is invalid.
    pub ignore_tls_errors: bool,

    /// Follow redirects (up to [`MAX_REDIRECTS`]) while performing the request.
    pub follow_redirects: bool,
}

impl Default for CheckOptions {
    fn default() -> Self {
        Self {
            get_fallback: true,
            ignore_tls_errors: false,
            follow_redirects: true,
        }
    }
}

impl CheckRequest {
    pub fn new(reference: impl Into<String>, method: Method, url: Url, timeout: Duration) -> Self {
        Self {
            reference: reference.into(),
            method,
            url,
            timeout,
            options: CheckOptions::default(),
        }
    }

    pub fn with_options(mut self, options: CheckOptions) -> Self {
        self.options = options;
        self
    }

    /// The timeout actually applied to the probe. A zero timeout means
    /// "no preference" and gets the ceiling as well.
    pub fn effective_timeout(&self) -> Duration {
        if self.timeout.is_zero() {
            return MAX_TIMEOUT;
        }
        self.timeout.min(MAX_TIMEOUT)
    }

    /// Whether a failed attempt made with `method` may be replaced by a GET attempt.
    pub(crate) fn allows_fallback(&self, method: &Method) -> bool {
        self.options.get_fallback && *method == Method::HEAD
    }
}
