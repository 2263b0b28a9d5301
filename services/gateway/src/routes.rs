//! Route table
//!
//! Maps every method the gateway accepts to the backend service type that
//! serves it and the routing strategy used to get there.

use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteMode {
    /// One named instance
    Unary,
    /// Every live instance, best effort
    Broadcast,
    /// Server streams of every live instance merged into one
    Merge,
    /// Client stream relayed to the instance named by its first item
    ClientStream,
    /// Bidirectional stream relayed to the instance named by its first item
    Duplex,
    /// Chunked upload rebuilt at the gateway, then stored on one instance
    Reassemble,
}

impl fmt::Display for RouteMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RouteMode::Unary => "unary",
            RouteMode::Broadcast => "broadcast",
            RouteMode::Merge => "merge",
            RouteMode::ClientStream => "client_stream",
            RouteMode::Duplex => "duplex",
            RouteMode::Reassemble => "reassemble",
        };
        f.write_str(name)
    }
}

/// One routed method
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Fully qualified method, `Service/Method`
    pub method: String,
    pub service_type: String,
    pub mode: RouteMode,
    /// Feature name checked against the required-feature policy;
    /// defaults to the lowercased service type
    #[serde(default)]
    pub feature: Option<String>,
}

impl Route {
    pub fn new(method: &str, service_type: &str, mode: RouteMode) -> Self {
        Self {
            method: method.to_string(),
            service_type: service_type.to_string(),
            mode,
            feature: None,
        }
    }

    pub fn feature(&self) -> String {
        self.feature
            .clone()
            .unwrap_or_else(|| self.service_type.to_ascii_lowercase())
    }
}

#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: HashMap<String, Route>,
}

impl RouteTable {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Routes for the built-in backend contracts
    pub fn with_defaults() -> Self {
        let mut table = Self::empty();
        for route in [
            Route::new("Audit/AddEntry", "Audit", RouteMode::Broadcast),
            Route::new("Analytics/LogEvent", "Analytics", RouteMode::Broadcast),
            Route::new("Analytics/Query", "Analytics", RouteMode::Merge),
            Route::new("Results/GetResult", "Results", RouteMode::Unary),
            Route::new("Results/UploadImage", "Results", RouteMode::Reassemble),
            Route::new("Agents/GetStatus", "Agents", RouteMode::Unary),
            Route::new("Agents/Session", "Agents", RouteMode::Duplex),
            Route::new("Agents/PushLogs", "Agents", RouteMode::ClientStream),
        ] {
            table.routes.insert(route.method.clone(), route);
        }
        table
    }

    /// Add or replace routes
    pub fn extend<I: IntoIterator<Item = Route>>(&mut self, routes: I) -> Result<()> {
        for route in routes {
            if route.method.is_empty() || !route.method.contains('/') {
                return Err(GatewayError::config(format!(
                    "route method '{}' must look like Service/Method",
                    route.method
                )));
            }
            if route.service_type.is_empty() {
                return Err(GatewayError::config(format!(
                    "route '{}' has no service type",
                    route.method
                )));
            }
            self.routes.insert(route.method.clone(), route);
        }
        Ok(())
    }

    pub fn get(&self, method: &str) -> Option<&Route> {
        self.routes.get(method)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Routes sorted by method name
    pub fn routes(&self) -> Vec<&Route> {
        let mut routes: Vec<&Route> = self.routes.values().collect();
        routes.sort_by(|a, b| a.method.cmp(&b.method));
        routes
    }
}
