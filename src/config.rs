//! Controller configuration from `FLOWSHIFT_*` environment variables

use crate::router::{Provider, RouterError, RouterOptions};
use k8s_openapi::api::core::v1::ServicePort;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use thiserror::Error;

/// Default port for `/healthz`, `/readyz` and `/metrics`
pub const DEFAULT_HEALTH_PORT: u16 = 8080;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("FLOWSHIFT_PROVIDER: {0}")]
    Provider(#[from] RouterError),

    #[error("{var}: invalid value {value:?}")]
    Invalid { var: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub router: RouterOptions,
    pub health_port: u16,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any key lookup, unset keys keep defaults
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut router = RouterOptions::default();

        if let Some(provider) = var("FLOWSHIFT_PROVIDER") {
            router.provider = provider.parse::<Provider>()?;
        }
        if let Some(label) = var("FLOWSHIFT_SELECTOR_LABEL") {
            router.selector_label = label;
        }
        if let Some(prefix) = var("FLOWSHIFT_ANNOTATION_PREFIX") {
            router.annotation_prefix = prefix;
        }
        if let Some(prefix) = var("FLOWSHIFT_INGRESS_ANNOTATION_PREFIX") {
            router.ingress_annotation_prefix = prefix;
        }
        router.ingress_class = var("FLOWSHIFT_INGRESS_CLASS");
        if let Some(prefixes) = var("FLOWSHIFT_INCLUDE_LABEL_PREFIX") {
            router.include_label_prefix = split_list(&prefixes).map(str::to_string).collect();
        }
        if let Some(ports) = var("FLOWSHIFT_EXTRA_PORTS") {
            router.extra_ports = split_list(&ports)
                .map(extra_port)
                .collect::<Result<_, _>>()?;
        }
        if let Some(value) = var("FLOWSHIFT_SET_OWNER_REFS") {
            router.set_owner_refs = parse_bool("FLOWSHIFT_SET_OWNER_REFS", &value)?;
        }

        let health_port = match var("FLOWSHIFT_HEALTH_PORT") {
            None => DEFAULT_HEALTH_PORT,
            Some(value) => value.parse().map_err(|_| ConfigError::Invalid {
                var: "FLOWSHIFT_HEALTH_PORT",
                value,
            })?,
        };

        Ok(Self {
            router,
            health_port,
        })
    }
}

fn split_list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(ConfigError::Invalid {
            var,
            value: value.to_string(),
        }),
    }
}

/// `name:port`, exposed on the apex, primary and canary Services
fn extra_port(entry: &str) -> Result<ServicePort, ConfigError> {
    let invalid = || ConfigError::Invalid {
        var: "FLOWSHIFT_EXTRA_PORTS",
        value: entry.to_string(),
    };
    let (name, port) = entry.split_once(':').ok_or_else(invalid)?;
    let port: i32 = port.parse().map_err(|_| invalid())?;
    if name.is_empty() || !(1..=65535).contains(&port) {
        return Err(invalid());
    }
    Ok(ServicePort {
        name: Some(name.to_string()),
        port,
        protocol: Some("TCP".to_string()),
        target_port: Some(IntOrString::Int(port)),
        ..Default::default()
    })
}
