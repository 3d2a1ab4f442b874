use serde::Deserialize;

/// An organisation configuration for the Pulsebox agent.
/// Contains the organisation ID, the polling interval in seconds, and a list of target configurations.
#[derive(Debug, Clone, Deserialize)]
pub struct OrganisationConfig {
    /// The organisation ID for which this configuration applies.
    /// Sent along with every result produced for this organisation.
    pub organisation_id: String,

    /// The polling interval in seconds.
    pub polling_interval_seconds: u64,

    /// The targets checked on every interval.
    pub targets: Vec<TargetConfig>,
}

/// A single check target and its policy flags.
#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
    /// The URL of the target service to be monitored.
    pub url: String,

    /// Reference reported with the results. Defaults to the URL.
    #[serde(default)]
    pub reference: Option<String>,

    #[serde(default = "default_method")]
    pub method: String,

    /// Requested timeout in milliseconds. Capped at 30 seconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Retry a failed HEAD check once with GET.
    #[serde(default = "default_true")]
    pub get_fallback: bool,

    #[serde(default)]
    pub ignore_tls_errors: bool,

    #[serde(default = "default_true")]
    pub follow_redirects: bool,
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_timeout_ms() -> u64 {
    15_000
}

fn default_true() -> bool {
    true
}

pub type Config = std::collections::HashMap<String, OrganisationConfig>;
