//! Builtin connector implementations.
//!
//! Each supported type resolves to either the HTTP-backed connector (when the
//! definition carries a `baseUrl` setting) or the deterministic simulated
//! connector used for local development and tests.

pub mod http;
pub mod sim;

use std::sync::Arc;

use crate::registry::ConnectorRegistry;
use crate::Connector;

pub const SIEM: &str = "siem";
pub const EDR: &str = "edr";
pub const THREAT_INTEL: &str = "threat_intel";

pub const BUILTIN_TYPES: [&str; 3] = [SIEM, EDR, THREAT_INTEL];

/// Register factories for every builtin connector type.
pub async fn register_builtin_factories(registry: &ConnectorRegistry) {
    for connector_type in BUILTIN_TYPES {
        registry
            .register_factory(
                connector_type,
                Arc::new(move |definition| {
                    let connector: Arc<dyn Connector> = if definition
                        .settings
                        .get("baseUrl")
                        .and_then(|v| v.as_str())
                        .is_some()
                    {
                        Arc::new(http::HttpConnector::new(connector_type.to_string()))
                    } else {
                        Arc::new(sim::SimConnector::new(
                            connector_type.to_string(),
                            sim::SimProfile::default(),
                        ))
                    };
                    Ok(connector)
                }),
            )
            .await;
    }
}
