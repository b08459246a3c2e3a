//! Command template rendering.
//!
//! All probe and action command templates are Handlebars in strict mode:
//! a template referencing a variable the session cannot supply fails at
//! render time instead of producing a half-formed command line.

use handlebars::Handlebars;
use serde_json::Value;

/// Strict-mode Handlebars wrapper shared by the executor.
pub struct TemplateEngine {
    registry: Handlebars<'static>,
}

impl TemplateEngine {
    /// Create a strict-mode engine.
    #[must_use]
    pub fn new() -> Self {
        let mut registry = Handlebars::new();
        registry.set_strict_mode(true);
        Self { registry }
    }

    /// Render a one-off template string against the given variables.
    pub fn render(&self, template: &str, vars: &Value) -> Result<String, String> {
        self.registry
            .render_template(template, vars)
            .map_err(|e| e.to_string())
    }

    /// Check that a template parses, without rendering it.
    ///
    /// Used by the knowledge base loader to reject malformed templates
    /// before a session ever schedules them.
    pub fn validate(template: &str) -> Result<(), String> {
        let mut scratch = Handlebars::new();
        scratch
            .register_template_string("probe", template)
            .map_err(|e| e.to_string())
    }
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}
