//! Transaction-code router.
//!
//! Maps the `TransCode` field of a JSON request to a registered handler.
//! Only that one field is decoded; the rest of the payload belongs to the
//! handler. Routes are registered on an owned `Router` before serving starts
//! and the router is then shared read-only behind an `Arc`.

use serde::Deserialize;
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

/// Sent when the transaction code cannot be extracted from the request.
pub const TRANSCODE_PARSE_ERROR: &[u8] = b"transcode parse error";

/// Sent when no handler is registered for the transaction code.
pub const INVALID_TRANSACTION: &[u8] = b"invalid transaction";

/// Business logic for one transaction code.
///
/// Receives the complete raw request body and returns the response body.
/// An empty response is treated as an error by the connection.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, request: &[u8]) -> Vec<u8>;
}

impl<F> Handler for F
where
    F: Fn(&[u8]) -> Vec<u8> + Send + Sync + 'static,
{
    fn handle(&self, request: &[u8]) -> Vec<u8> {
        self(request)
    }
}

/// A shareable, type-erased handler.
pub type BoxHandler = Arc<dyn Handler>;

/// Route registration failures. Rejected registrations leave the table as it was.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegisterError {
    #[error("transaction code is empty")]
    EmptyCode,

    #[error("no handler supplied for transaction code '{0}'")]
    MissingHandler(String),

    #[error("transaction code '{0}' is already registered")]
    Duplicate(String),
}

/// The one field the router needs out of a request.
#[derive(Deserialize)]
struct TransCodeField<'a> {
    #[serde(rename = "TransCode", borrow)]
    trans_code: Cow<'a, str>,
}

/// Transaction-code to handler table.
#[derive(Default)]
pub struct Router {
    routes: HashMap<String, BoxHandler>,
}

impl Router {
    /// Create an empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `code`.
    pub fn register<H: Handler>(&mut self, code: &str, handler: H) -> Result<(), RegisterError> {
        self.register_boxed(code, Some(Arc::new(handler)))
    }

    /// Register an optional, already boxed handler under `code`.
    ///
    /// Insert-once: an empty code, a missing handler, or a code that is
    /// already present is logged and rejected without touching the table.
    pub fn register_boxed(
        &mut self,
        code: &str,
        handler: Option<BoxHandler>,
    ) -> Result<(), RegisterError> {
        let result = self.insert(code, handler);
        match &result {
            Ok(()) => info!(code, "Registered route"),
            Err(e) => error!(code, error = %e, "Rejected route registration"),
        }
        result
    }

    fn insert(&mut self, code: &str, handler: Option<BoxHandler>) -> Result<(), RegisterError> {
        if code.is_empty() {
            return Err(RegisterError::EmptyCode);
        }
        let handler = handler.ok_or_else(|| RegisterError::MissingHandler(code.to_string()))?;
        if self.routes.contains_key(code) {
            return Err(RegisterError::Duplicate(code.to_string()));
        }
        self.routes.insert(code.to_string(), handler);
        Ok(())
    }

    /// Resolve a raw request to its handler and return the response body.
    ///
    /// Routing failures are answered with a sentinel body rather than an
    /// error; a handler is only ever invoked on a successful lookup.
    pub fn dispatch(&self, request: &[u8]) -> Vec<u8> {
        let code = match extract_trans_code(request) {
            Ok(code) => code,
            Err(reason) => {
                warn!(%reason, "Failed to parse transaction code");
                return TRANSCODE_PARSE_ERROR.to_vec();
            }
        };

        match self.routes.get(code.as_ref()) {
            Some(handler) => {
                info!(code = %code, "Dispatching transaction");
                handler.handle(request)
            }
            None => {
                warn!(code = %code, "Unknown transaction code");
                INVALID_TRANSACTION.to_vec()
            }
        }
    }

    /// Whether a handler is registered for `code`.
    pub fn contains(&self, code: &str) -> bool {
        self.routes.contains_key(code)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Registered codes in sorted order.
    pub fn codes(&self) -> Vec<&str> {
        let mut codes: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        codes.sort_unstable();
        codes
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("codes", &self.codes())
            .finish()
    }
}

/// Pull the `TransCode` string out of a JSON object without decoding the rest.
fn extract_trans_code(request: &[u8]) -> Result<Cow<'_, str>, String> {
    // serde would otherwise accept a one-element array as the struct
    let first = request.iter().find(|b| !b.is_ascii_whitespace());
    if first != Some(&b'{') {
        return Err("request is not a JSON object".to_string());
    }

    serde_json::from_slice::<TransCodeField>(request)
        .map(|field| field.trans_code)
        .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(counter: &Arc<AtomicUsize>, reply: &'static [u8]) -> impl Handler {
        let counter = Arc::clone(counter);
        move |_: &[u8]| {
            counter.fetch_add(1, Ordering::SeqCst);
            reply.to_vec()
        }
    }

    #[test]
    fn test_dispatch_registered_code() {
        let mut router = Router::new();
        router
            .register("1001", |req: &[u8]| {
                let mut out = b"echo:".to_vec();
                out.extend_from_slice(req);
                out
            })
            .unwrap();

        let request = br#"{"TransCode":"1001","test":"test"}"#;
        let response = router.dispatch(request);
        assert_eq!(response, [&b"echo:"[..], &request[..]].concat());
    }

    #[test]
    fn test_register_rejects_empty_code() {
        let mut router = Router::new();
        assert_eq!(
            router.register("", |_: &[u8]| b"x".to_vec()),
            Err(RegisterError::EmptyCode)
        );
        assert!(router.is_empty());
    }

    #[test]
    fn test_register_rejects_missing_handler() {
        let mut router = Router::new();
        assert_eq!(
            router.register_boxed("X", None),
            Err(RegisterError::MissingHandler("X".to_string()))
        );
        assert!(!router.contains("X"));
    }

    #[test]
    fn test_register_is_insert_once() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let mut router = Router::new();
        router.register("X", counting(&first, b"h1")).unwrap();
        assert_eq!(
            router.register("X", counting(&second, b"h2")),
            Err(RegisterError::Duplicate("X".to_string()))
        );
        assert_eq!(router.len(), 1);

        let response = router.dispatch(br#"{"TransCode":"X"}"#);
        assert_eq!(response, b"h1");
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unknown_code_never_invokes_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut router = Router::new();
        router.register("1001", counting(&calls, b"ok")).unwrap();

        let response = router.dispatch(br#"{"TransCode":"2002","test":"test"}"#);
        assert_eq!(response, INVALID_TRANSACTION);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_parse_errors() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut router = Router::new();
        router.register("1001", counting(&calls, b"ok")).unwrap();

        let bad: [&[u8]; 7] = [
            b"not json",
            b"",
            br#"{"TransCode":1001}"#,
            br#"{"test":"test"}"#,
            br#"{"TransCode":"1001""#,
            br#"["1001"]"#,
            br#""1001""#,
        ];
        for request in bad {
            assert_eq!(
                router.dispatch(request),
                TRANSCODE_PARSE_ERROR,
                "request {:?}",
                String::from_utf8_lossy(request)
            );
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_extract_trans_code_ignores_rest_of_payload() {
        let request = br#" {"nested":{"a":[1,2,3]},"TransCode":"1001","n":null} "#;
        assert_eq!(extract_trans_code(request).unwrap(), "1001");
    }

    #[test]
    fn test_codes_sorted() {
        let mut router = Router::new();
        for code in ["3003", "1001", "2002"] {
            router.register(code, |_: &[u8]| b"ok".to_vec()).unwrap();
        }
        assert_eq!(router.codes(), vec!["1001", "2002", "3003"]);
    }
}
