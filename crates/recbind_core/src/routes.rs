//! Route templates and placeholder interpolation.

use crate::error::{BindError, BindResult};
use crate::lifecycle::Operation;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

/// Default placeholder pattern: `{name}`, capturing the parameter name.
pub const DEFAULT_PARAMETER_PATTERN: &str = r"\{([^{}]+)\}";

static DEFAULT_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(DEFAULT_PARAMETER_PATTERN).expect("default pattern is valid"));

/// URL templates for the three operations of a record or aggregate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteSet {
    /// Template for fetch.
    pub fetch: Option<String>,
    /// Template for save.
    pub save: Option<String>,
    /// Template for delete.
    pub delete: Option<String>,
}

impl RouteSet {
    /// Creates an empty route set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the fetch template.
    pub fn with_fetch(mut self, template: impl Into<String>) -> Self {
        self.fetch = Some(template.into());
        self
    }

    /// Sets the save template.
    pub fn with_save(mut self, template: impl Into<String>) -> Self {
        self.save = Some(template.into());
        self
    }

    /// Sets the delete template.
    pub fn with_delete(mut self, template: impl Into<String>) -> Self {
        self.delete = Some(template.into());
        self
    }

    /// Returns the template for an operation, or a route error when the
    /// operation has no route configured.
    pub fn template(&self, operation: Operation) -> BindResult<&str> {
        let template = match operation {
            Operation::Fetch => self.fetch.as_deref(),
            Operation::Save => self.save.as_deref(),
            Operation::Delete => self.delete.as_deref(),
        };
        template.ok_or_else(|| {
            BindError::route(format!("no {} route configured", operation.as_str()))
        })
    }
}

/// Resolves a route template against a parameter map.
///
/// Placeholders are matched by `pattern` (first capture group = parameter
/// name) and replaced with the stringified parameter value. A placeholder
/// with no matching parameter is a route error, never silently left in
/// the URL.
pub fn interpolate(template: &str, parameters: &Map<String, Value>, pattern: &str) -> BindResult<String> {
    let custom;
    let regex = if pattern == DEFAULT_PARAMETER_PATTERN {
        &*DEFAULT_PATTERN
    } else {
        custom = Regex::new(pattern)
            .map_err(|e| BindError::route(format!("invalid parameter pattern: {e}")))?;
        &custom
    };

    let mut url = String::with_capacity(template.len());
    let mut last = 0;
    for captures in regex.captures_iter(template) {
        let whole = captures.get(0).expect("capture 0 always present");
        let name = captures
            .get(1)
            .ok_or_else(|| BindError::route("parameter pattern has no capture group"))?
            .as_str();

        let value = parameters
            .get(name)
            .ok_or_else(|| BindError::route(format!("missing route parameter: {name}")))?;

        url.push_str(&template[last..whole.start()]);
        url.push_str(&stringify(value));
        last = whole.end();
    }
    url.push_str(&template[last..]);
    Ok(url)
}

/// Renders a parameter value into a URL segment.
pub(crate) fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn replaces_placeholders() {
        let p = params(json!({"id": 5, "kind": "task"}));
        let url = interpolate("/api/{kind}/{id}", &p, DEFAULT_PARAMETER_PATTERN).unwrap();
        assert_eq!(url, "/api/task/5");
    }

    #[test]
    fn strings_are_not_quoted() {
        let p = params(json!({"slug": "alpha-1"}));
        let url = interpolate("/p/{slug}", &p, DEFAULT_PARAMETER_PATTERN).unwrap();
        assert_eq!(url, "/p/alpha-1");
    }

    #[test]
    fn missing_parameter_is_an_error() {
        let p = params(json!({}));
        let result = interpolate("/api/{id}", &p, DEFAULT_PARAMETER_PATTERN);
        assert!(matches!(result, Err(BindError::Route { .. })));
    }

    #[test]
    fn custom_pattern() {
        let p = params(json!({"id": 7}));
        let url = interpolate("/api/:id", &p, r":(\w+)").unwrap();
        assert_eq!(url, "/api/7");
    }

    #[test]
    fn template_lookup_errors_when_unset() {
        let routes = RouteSet::new().with_fetch("/api/tasks");
        assert!(routes.template(Operation::Fetch).is_ok());
        assert!(matches!(
            routes.template(Operation::Save),
            Err(BindError::Route { .. })
        ));
    }
}
