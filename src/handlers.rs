//! Built-in business handlers and the route table loader.
//!
//! Handlers are looked up by name so the `[routes]` table in the config file
//! can bind transaction codes to them without recompiling.

use crate::router::{BoxHandler, Router};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

/// Answer used when a 1001 request cannot be decoded.
const BAD_REQUEST_1001: &[u8] = br#"{"ret":-1,"msg":"bad request","test":""}"#;

#[derive(Debug, Deserialize)]
struct Request1001 {
    #[serde(rename = "TransCode")]
    trans_code: String,
    #[serde(default, alias = "Test")]
    test: String,
}

#[derive(Debug, Serialize)]
struct Response1001 {
    ret: i32,
    msg: String,
    test: String,
}

/// Demo transaction 1001: greets the caller with its code and `test` field.
pub fn p1001(request: &[u8]) -> Vec<u8> {
    let request: Request1001 = match serde_json::from_slice(request) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "Failed to decode 1001 request");
            return BAD_REQUEST_1001.to_vec();
        }
    };
    debug!(code = %request.trans_code, test = %request.test, "Handling 1001");

    let response = Response1001 {
        ret: 0,
        msg: "succ".to_string(),
        test: format!("hello {} {}", request.trans_code, request.test),
    };
    serde_json::to_vec(&response).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to encode 1001 response");
        BAD_REQUEST_1001.to_vec()
    })
}

/// Answers with the request body unchanged.
pub fn echo(request: &[u8]) -> Vec<u8> {
    request.to_vec()
}

/// Named handlers available to the route table loader.
#[derive(Default)]
pub struct HandlerCatalog {
    handlers: HashMap<String, BoxHandler>,
}

impl HandlerCatalog {
    /// An empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// The handlers shipped with the server.
    pub fn builtin() -> Self {
        let mut catalog = Self::new();
        catalog.add("p1001", Arc::new(p1001));
        catalog.add("echo", Arc::new(echo));
        catalog
    }

    /// Add or replace a named handler.
    pub fn add(&mut self, name: &str, handler: BoxHandler) {
        self.handlers.insert(name.to_string(), handler);
    }

    pub fn get(&self, name: &str) -> Option<BoxHandler> {
        self.handlers.get(name).cloned()
    }
}

/// Build a router from `code -> handler name` pairs.
///
/// A name missing from the catalog is registered as a missing handler, which
/// the router rejects and logs; the remaining routes are still registered.
pub fn build_router(routes: &BTreeMap<String, String>, catalog: &HandlerCatalog) -> Router {
    let mut router = Router::new();
    for (code, name) in routes {
        let handler = catalog.get(name);
        if handler.is_none() {
            warn!(code = %code, handler = %name, "Unknown handler name in route table");
        }
        // rejections are logged by the router
        let _ = router.register_boxed(code, handler);
    }
    router
}
