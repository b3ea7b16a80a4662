use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// An HTTP request template: method, parameters and headers.
///
/// The engine never mutates a shared request; it clones the default request
/// and swaps a single parameter for an injected payload before dispatch.
#[derive(Debug, Clone)]
pub struct Request {
    method: String,
    params: HashMap<String, String>,
    headers: HashMap<String, String>,
}

impl Request {
    pub fn new(
        method: impl Into<String>,
        params: HashMap<String, String>,
        headers: HashMap<String, String>,
    ) -> Self {
        Self {
            method: method.into(),
            params,
            headers,
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn params(&self) -> &HashMap<String, String> {
        &self.params
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// Replaces the parameter map, returning the request for chaining.
    pub fn set_params(mut self, params: HashMap<String, String>) -> Self {
        self.params = params;
        self
    }

    /// Replaces the method, returning the request for chaining.
    pub fn set_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    /// Replaces the header map, returning the request for chaining.
    pub fn set_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }
}

impl fmt::Display for Request {
    /// Debug-log rendering only; not part of the wire protocol. Maps are
    /// printed in key order so log lines stay stable.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params: BTreeMap<_, _> = self.params.iter().collect();
        let headers: BTreeMap<_, _> = self.headers.iter().collect();
        write!(
            f,
            "params: {:?}, method: {}, headers: {:?}",
            params, self.method, headers
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn some_params() -> HashMap<String, String> {
        HashMap::from([
            ("id".to_string(), "1".to_string()),
            ("Submit".to_string(), "Submit".to_string()),
        ])
    }

    #[test]
    fn getters_return_constructor_values() {
        let request = Request::new("get", some_params(), HashMap::new());
        assert_eq!(request.method(), "get");
        assert_eq!(request.params().get("id").unwrap(), "1");
        assert!(request.headers().is_empty());
    }

    #[test]
    fn setters_chain_and_replace_whole_maps() {
        let request = Request::new("get", some_params(), HashMap::new())
            .set_method("post")
            .set_params(HashMap::from([("user".to_string(), "a".to_string())]))
            .set_headers(HashMap::from([(
                "Cookie".to_string(),
                "session=x".to_string(),
            )]));

        assert_eq!(request.method(), "post");
        assert_eq!(request.params().len(), 1);
        assert_eq!(request.params().get("user").unwrap(), "a");
        assert_eq!(request.headers().get("Cookie").unwrap(), "session=x");
    }

    #[test]
    fn display_is_stable_for_debug_logs() {
        let request = Request::new(
            "get",
            HashMap::from([("id".to_string(), "1".to_string())]),
            HashMap::new(),
        );
        assert_eq!(
            request.to_string(),
            r#"params: {"id": "1"}, method: get, headers: {}"#
        );
    }

    #[test]
    fn clone_isolates_mutation() {
        let original = Request::new("get", some_params(), HashMap::new());
        let mut injected = original.params().clone();
        injected.insert("id".to_string(), "1 and 0 or sleep(1)".to_string());
        let cloned = original.clone().set_params(injected);

        assert_eq!(original.params().get("id").unwrap(), "1");
        assert_eq!(cloned.params().get("id").unwrap(), "1 and 0 or sleep(1)");
    }
}
