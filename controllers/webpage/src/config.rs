//! Controller configuration.
//!
//! All settings come from environment variables and are read once at
//! startup. Invalid values fail startup rather than falling back silently.

use crate::error::ControllerError;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

/// Whether dependents are re-applied on every pass or only created once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DependentPolicy {
    /// Server-side apply both dependents on every pass; drift is corrected.
    #[default]
    ConvergeAlways,
    /// Create missing dependents, never modify existing ones.
    CreateOnce,
}

impl FromStr for DependentPolicy {
    type Err = ControllerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "converge-always" | "convergealways" | "always" => Ok(Self::ConvergeAlways),
            "create-once" | "createonce" | "once" => Ok(Self::CreateOnce),
            other => Err(ControllerError::InvalidConfig(format!(
                "DEPENDENT_POLICY must be converge-always or create-once, got {other:?}"
            ))),
        }
    }
}

/// How dependents are removed when their WebPage is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CascadeMode {
    /// Owner references only; the API server garbage collector deletes dependents.
    #[default]
    Native,
    /// A finalizer on the WebPage; the reconciler deletes dependents itself.
    Explicit,
}

impl FromStr for CascadeMode {
    type Err = ControllerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "native" => Ok(Self::Native),
            "explicit" | "finalizer" => Ok(Self::Explicit),
            other => Err(ControllerError::InvalidConfig(format!(
                "CASCADE_MODE must be native or explicit, got {other:?}"
            ))),
        }
    }
}

/// Settings the reconciler needs for a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilerSettings {
    pub dependent_policy: DependentPolicy,
    pub cascade_mode: CascadeMode,
    /// Container image of the workload
    pub image: String,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            dependent_policy: DependentPolicy::default(),
            cascade_mode: CascadeMode::default(),
            image: "nginx".to_string(),
        }
    }
}

/// Full controller configuration.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Namespace to watch; `None` watches all namespaces
    pub namespace: Option<String>,
    pub reconciler: ReconcilerSettings,
    /// Deadline for one reconciliation pass
    pub reconcile_timeout: Duration,
    /// Maximum concurrent reconciliations
    pub concurrency: u16,
    /// Quiet period after the last event before reconciling
    pub debounce: Duration,
    /// Listen address of the probe and metrics server
    pub probe_addr: SocketAddr,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            reconciler: ReconcilerSettings::default(),
            reconcile_timeout: Duration::from_secs(30),
            concurrency: 4,
            debounce: Duration::from_secs(1),
            probe_addr: SocketAddr::from(([0, 0, 0, 0], 8081)),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ControllerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let dependent_policy = var("DEPENDENT_POLICY")
            .map(|v| v.parse::<DependentPolicy>())
            .transpose()?
            .unwrap_or_default();
        let cascade_mode = var("CASCADE_MODE")
            .map(|v| v.parse::<CascadeMode>())
            .transpose()?
            .unwrap_or_default();
        let image = var("WEBPAGE_IMAGE").unwrap_or(defaults.reconciler.image);

        let reconcile_timeout = match var("RECONCILE_TIMEOUT_SECS") {
            Some(v) => Duration::from_secs(parse_number::<u64>("RECONCILE_TIMEOUT_SECS", &v)?),
            None => defaults.reconcile_timeout,
        };
        if reconcile_timeout.is_zero() {
            return Err(ControllerError::InvalidConfig(
                "RECONCILE_TIMEOUT_SECS must be greater than zero".to_string(),
            ));
        }
        let concurrency = match var("RECONCILE_CONCURRENCY") {
            Some(v) => parse_number::<u16>("RECONCILE_CONCURRENCY", &v)?,
            None => defaults.concurrency,
        };
        let debounce = match var("RECONCILE_DEBOUNCE_SECS") {
            Some(v) => Duration::from_secs(parse_number::<u64>("RECONCILE_DEBOUNCE_SECS", &v)?),
            None => defaults.debounce,
        };
        let probe_addr = match var("PROBE_ADDR") {
            Some(v) => v.parse().map_err(|e| {
                ControllerError::InvalidConfig(format!(
                    "PROBE_ADDR {v:?} is not a socket address: {e}"
                ))
            })?,
            None => defaults.probe_addr,
        };

        Ok(Self {
            namespace: var("WATCH_NAMESPACE"),
            reconciler: ReconcilerSettings {
                dependent_policy,
                cascade_mode,
                image,
            },
            reconcile_timeout,
            concurrency,
            debounce,
            probe_addr,
        })
    }
}

fn parse_number<T>(key: &str, value: &str) -> Result<T, ControllerError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e| {
        ControllerError::InvalidConfig(format!("{key} {value:?} is not a valid number: {e}"))
    })
}
