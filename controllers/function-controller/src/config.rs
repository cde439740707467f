//! Configuration from environment variables.
//!
//! | Variable | Default |
//! |---|---|
//! | `KUBE_API_URL` | `https://kubernetes.default.svc` |
//! | `KUBE_TOKEN` | unset (falls back to `KUBE_TOKEN_FILE`) |
//! | `KUBE_TOKEN_FILE` | service account token path (optional) |
//! | `KUBE_CA_FILE` | unset |
//! | `WATCH_NAMESPACE` | `default` |
//! | `BOOTSTRAP_BACKOFF` | `fixed` (or `fibonacci`) |
//! | `BOOTSTRAP_RETRY_SECONDS` | `30` (the cap, for `fibonacci`) |
//! | `EVENT_QUEUE_CAPACITY` | `64` |
//! | `PROBE_ADDR` | `0.0.0.0:8080` |

use crate::backoff::{BackoffPolicy, DEFAULT_RETRY_DELAY, FibonacciBackoff};
use crate::controller::{ControllerSettings, DEFAULT_QUEUE_CAPACITY};
use crate::error::ControllerError;
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// In-cluster API server address.
pub const DEFAULT_API_URL: &str = "https://kubernetes.default.svc";

/// Where Kubernetes mounts the service account token.
pub const SERVICE_ACCOUNT_TOKEN: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";

/// Default probe listener.
pub const DEFAULT_PROBE_ADDR: &str = "0.0.0.0:8080";

/// Controller configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// API server base URL
    pub api_url: String,
    /// Bearer token given inline
    pub token: Option<String>,
    /// File to read the bearer token from
    pub token_file: PathBuf,
    /// Whether `token_file` was set explicitly (and so must exist)
    pub token_file_required: bool,
    /// Extra CA bundle (PEM)
    pub ca_file: Option<PathBuf>,
    /// Namespace whose functions are watched
    pub namespace: String,
    /// Whether registration retries grow (`fibonacci`) or stay fixed
    pub bootstrap_fibonacci: bool,
    /// Delay between resource type registration attempts (maximum, if growing)
    pub bootstrap_retry: Duration,
    /// Capacity of the event queue
    pub queue_capacity: usize,
    /// Probe server listen address
    pub probe_addr: SocketAddr,
}

impl Config {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Read configuration through `lookup`; empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ControllerError> {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let api_url = get("KUBE_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string());
        let token_file_override = get("KUBE_TOKEN_FILE").map(PathBuf::from);
        let token_file_required = token_file_override.is_some();

        let bootstrap_retry = match get("BOOTSTRAP_RETRY_SECONDS") {
            Some(value) => Duration::from_secs(parse("BOOTSTRAP_RETRY_SECONDS", &value)?),
            None => DEFAULT_RETRY_DELAY,
        };
        if bootstrap_retry.is_zero() {
            return Err(ControllerError::InvalidConfig(
                "BOOTSTRAP_RETRY_SECONDS must be greater than zero".to_string(),
            ));
        }

        let bootstrap_fibonacci = match get("BOOTSTRAP_BACKOFF").as_deref().map(str::trim) {
            None | Some("fixed") => false,
            Some("fibonacci") => true,
            Some(other) => {
                return Err(ControllerError::InvalidConfig(format!(
                    "BOOTSTRAP_BACKOFF must be \"fixed\" or \"fibonacci\", got {other:?}"
                )));
            }
        };

        let queue_capacity = match get("EVENT_QUEUE_CAPACITY") {
            Some(value) => parse("EVENT_QUEUE_CAPACITY", &value)?,
            None => DEFAULT_QUEUE_CAPACITY,
        };
        if queue_capacity == 0 {
            return Err(ControllerError::InvalidConfig(
                "EVENT_QUEUE_CAPACITY must be greater than zero".to_string(),
            ));
        }

        let probe_addr = parse(
            "PROBE_ADDR",
            &get("PROBE_ADDR").unwrap_or_else(|| DEFAULT_PROBE_ADDR.to_string()),
        )?;

        Ok(Self {
            api_url,
            token: get("KUBE_TOKEN").map(|token| token.trim().to_string()),
            token_file: token_file_override.unwrap_or_else(|| PathBuf::from(SERVICE_ACCOUNT_TOKEN)),
            token_file_required,
            ca_file: get("KUBE_CA_FILE").map(PathBuf::from),
            namespace: get("WATCH_NAMESPACE").unwrap_or_else(|| "default".to_string()),
            bootstrap_fibonacci,
            bootstrap_retry,
            queue_capacity,
            probe_addr,
        })
    }

    /// Bearer token: `KUBE_TOKEN`, else the token file. A missing default
    /// token file means no token; a missing explicit one is an error.
    pub fn resolve_token(&self) -> Result<Option<String>, ControllerError> {
        if let Some(token) = &self.token {
            return Ok(Some(token.clone()));
        }

        match std::fs::read_to_string(&self.token_file) {
            Ok(token) => Ok(Some(token.trim().to_string()).filter(|token| !token.is_empty())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !self.token_file_required => {
                Ok(None)
            }
            Err(e) => Err(ControllerError::InvalidConfig(format!(
                "failed to read token file {}: {e}",
                self.token_file.display()
            ))),
        }
    }

    /// Contents of the CA bundle, if one is configured.
    pub fn resolve_ca(&self) -> Result<Option<Vec<u8>>, ControllerError> {
        self.ca_file
            .as_ref()
            .map(|path| {
                std::fs::read(path).map_err(|e| {
                    ControllerError::InvalidConfig(format!(
                        "failed to read CA file {}: {e}",
                        path.display()
                    ))
                })
            })
            .transpose()
    }

    /// Settings for the controller itself.
    #[must_use]
    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            namespace: self.namespace.clone(),
            queue_capacity: self.queue_capacity,
            bootstrap_backoff: if self.bootstrap_fibonacci {
                BackoffPolicy::Fibonacci(FibonacciBackoff::new(
                    1,
                    self.bootstrap_retry.as_secs().max(1),
                ))
            } else {
                BackoffPolicy::Fixed(self.bootstrap_retry)
            },
        }
    }
}

fn parse<T>(key: &str, value: &str) -> Result<T, ControllerError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| ControllerError::InvalidConfig(format!("{key}={value:?} is invalid: {e}")))
}
