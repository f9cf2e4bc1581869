//! Configuration surface for records and aggregates.

/// HTTP verb used for an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// HTTP GET.
    Get,
    /// HTTP POST.
    Post,
    /// HTTP PUT.
    Put,
    /// HTTP PATCH.
    Patch,
    /// HTTP DELETE.
    Delete,
}

impl Method {
    /// Returns the verb as an uppercase string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }
}

/// Operation-to-verb mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Methods {
    /// Verb for fetching a record or an aggregate page.
    pub fetch: Method,
    /// Verb for saving a record without an identifier.
    pub create: Method,
    /// Verb for saving a record that already exists.
    pub update: Method,
    /// Verb for partial updates when the `patch` policy is on.
    pub patch: Method,
    /// Verb for bulk aggregate saves.
    pub save: Method,
    /// Verb for deletes.
    pub delete: Method,
}

impl Default for Methods {
    fn default() -> Self {
        Self {
            fetch: Method::Get,
            create: Method::Post,
            update: Method::Put,
            patch: Method::Patch,
            save: Method::Post,
            delete: Method::Delete,
        }
    }
}

/// Per-schema behavior switches.
///
/// Built with `with_*` methods over [`Options::default`].
#[derive(Debug, Clone)]
pub struct Options {
    /// Attribute name used to determine existence.
    pub identifier: String,
    /// Allow a save response to overwrite a differing identifier.
    pub overwrite_identifier: bool,
    /// Send only changed attributes on update, using the patch verb.
    pub patch: bool,
    /// Allow saving when nothing changed; when off, such a save is
    /// redundant and never reaches the transport.
    pub save_unchanged: bool,
    /// Keep only the first error per attribute.
    pub use_first_error_only: bool,
    /// Validate an attribute as part of mutating it.
    pub validate_on_change: bool,
    /// Include attached nested entities in validation.
    pub validate_recursively: bool,
    /// Apply mutation chains on every set.
    pub mutate_on_change: bool,
    /// Apply mutation chains before syncing active into reference.
    pub mutate_before_sync: bool,
    /// Apply mutation chains before building save data.
    pub mutate_before_save: bool,
    /// Send bulk delete identifiers in the request body; otherwise they
    /// go in a comma-joined query parameter. Never both.
    pub use_delete_body: bool,
    /// Operation-to-verb mapping.
    pub methods: Methods,
    /// Response status carrying per-attribute validation errors.
    pub validation_error_status: u16,
    /// Regex pattern matching route placeholders; the first capture group
    /// is the parameter name.
    pub route_parameter_pattern: String,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            identifier: "id".to_string(),
            overwrite_identifier: false,
            patch: false,
            save_unchanged: true,
            use_first_error_only: false,
            validate_on_change: false,
            validate_recursively: true,
            mutate_on_change: false,
            mutate_before_sync: true,
            mutate_before_save: true,
            use_delete_body: true,
            methods: Methods::default(),
            validation_error_status: 422,
            route_parameter_pattern: crate::routes::DEFAULT_PARAMETER_PATTERN.to_string(),
        }
    }
}

impl Options {
    /// Sets the identifier attribute name.
    pub fn with_identifier(mut self, name: impl Into<String>) -> Self {
        self.identifier = name.into();
        self
    }

    /// Allows a save response to overwrite a differing identifier.
    pub fn with_overwrite_identifier(mut self, allow: bool) -> Self {
        self.overwrite_identifier = allow;
        self
    }

    /// Sends only changed attributes on update.
    pub fn with_patch(mut self, patch: bool) -> Self {
        self.patch = patch;
        self
    }

    /// Controls whether an unchanged record may be saved.
    pub fn with_save_unchanged(mut self, allow: bool) -> Self {
        self.save_unchanged = allow;
        self
    }

    /// Keeps only the first error per attribute.
    pub fn with_first_error_only(mut self, first_only: bool) -> Self {
        self.use_first_error_only = first_only;
        self
    }

    /// Validates attributes as part of mutating them.
    pub fn with_validate_on_change(mut self, validate: bool) -> Self {
        self.validate_on_change = validate;
        self
    }

    /// Includes attached nested entities in validation.
    pub fn with_validate_recursively(mut self, recurse: bool) -> Self {
        self.validate_recursively = recurse;
        self
    }

    /// Applies mutation chains on every set.
    pub fn with_mutate_on_change(mut self, mutate: bool) -> Self {
        self.mutate_on_change = mutate;
        self
    }

    /// Applies mutation chains before sync.
    pub fn with_mutate_before_sync(mut self, mutate: bool) -> Self {
        self.mutate_before_sync = mutate;
        self
    }

    /// Applies mutation chains before building save data.
    pub fn with_mutate_before_save(mut self, mutate: bool) -> Self {
        self.mutate_before_save = mutate;
        self
    }

    /// Chooses between body and query placement for bulk delete ids.
    pub fn with_delete_body(mut self, use_body: bool) -> Self {
        self.use_delete_body = use_body;
        self
    }

    /// Replaces the operation-to-verb mapping.
    pub fn with_methods(mut self, methods: Methods) -> Self {
        self.methods = methods;
        self
    }

    /// Sets the validation-error response status.
    pub fn with_validation_error_status(mut self, status: u16) -> Self {
        self.validation_error_status = status;
        self
    }

    /// Sets the route placeholder pattern.
    pub fn with_route_parameter_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.route_parameter_pattern = pattern.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let options = Options::default();
        assert_eq!(options.identifier, "id");
        assert!(!options.overwrite_identifier);
        assert!(options.save_unchanged);
        assert!(options.validate_recursively);
        assert!(options.mutate_before_sync);
        assert!(options.use_delete_body);
        assert_eq!(options.validation_error_status, 422);
        assert_eq!(options.methods.fetch, Method::Get);
        assert_eq!(options.methods.update, Method::Put);
    }

    #[test]
    fn builder_chaining() {
        let options = Options::default()
            .with_identifier("uuid")
            .with_patch(true)
            .with_save_unchanged(false)
            .with_validation_error_status(400);

        assert_eq!(options.identifier, "uuid");
        assert!(options.patch);
        assert!(!options.save_unchanged);
        assert_eq!(options.validation_error_status, 400);
    }

    #[test]
    fn method_strings() {
        assert_eq!(Method::Get.as_str(), "GET");
        assert_eq!(Method::Patch.as_str(), "PATCH");
    }
}
