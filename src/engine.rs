use std::collections::HashMap;

use serde_json::Value;

use crate::builtins;
use crate::context::Context;
use crate::error::{HelpmateError, HelpmateResult};
use crate::interface::{Helper, HelperOptions, Hook, TemplateInterface};
use crate::parser;
use crate::precompile::Precompiled;
use crate::render::{RenderScope, render_node};

/// `HelpmateEngine` is the primary implementation of the
/// [`TemplateInterface`] trait: a registry of helpers and partials, the
/// pre/post hook chains, and the render entry points.
///
/// The block helpers `if`, `unless`, `each` and `with` are registered at
/// construction; everything else is caller-supplied.
///
/// # Examples
///
/// ```
/// use helpmate::{Context, HelpmateEngine, TemplateInterface};
/// use serde_json::json;
///
/// let engine = HelpmateEngine::new();
///
/// let mut context = Context::new();
/// context.insert("name", json!("World"));
///
/// let output = engine.render("Hello {{name}}!", &mut context).unwrap();
/// assert_eq!(output, "Hello World!");
/// ```
pub struct HelpmateEngine {
    helpers: HashMap<String, Box<Helper>>,
    partials: HashMap<String, String>,
    precompiled: HashMap<String, Precompiled>,
    pre_hooks: Vec<Hook>,
    post_hooks: Vec<Hook>,
}

impl HelpmateEngine {
    /// Creates a new engine with the built-in block helpers registered.
    pub fn new() -> Self {
        let mut engine = Self {
            helpers: HashMap::new(),
            partials: HashMap::new(),
            precompiled: HashMap::new(),
            pre_hooks: Vec::new(),
            post_hooks: Vec::new(),
        };
        engine.register_helper("if", builtins::helper_if);
        engine.register_helper("unless", builtins::helper_unless);
        engine.register_helper("each", builtins::helper_each);
        engine.register_helper("with", builtins::helper_with);
        engine
    }

    /// The raw source of a *global* partial. Inline partials live in the
    /// render scope, not here.
    pub(crate) fn partial_source(&self, name: &str) -> Option<String> {
        self.partials.get(name).cloned()
    }

    /// Register a precompiled procedure under its `template_id` for
    /// repeated invocation via [`TemplateInterface::render_precompiled`].
    ///
    /// # Errors
    /// - If the procedure was compiled without a `template_id`.
    pub fn register_precompiled(&mut self, compiled: Precompiled) -> HelpmateResult<()> {
        let id = compiled
            .template_id
            .clone()
            .ok_or(HelpmateError::MissingTemplateId)?;
        self.precompiled.insert(id, compiled);
        Ok(())
    }

    pub fn precompiled(&self, template_id: &str) -> Option<&Precompiled> {
        self.precompiled.get(template_id)
    }
}

impl Default for HelpmateEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateInterface for HelpmateEngine {
    fn register_helper<N, F>(&mut self, name: N, helper: F)
    where
        N: AsRef<str>,
        F: Fn(&mut Context, &HelperOptions<'_>, &[Value]) -> Value + Send + Sync + 'static,
    {
        self.helpers
            .insert(name.as_ref().to_string(), Box::new(helper));
    }

    fn helper(&self, name: &str) -> Option<&Helper> {
        self.helpers.get(name).map(|helper| &**helper)
    }

    fn has_helper(&self, name: &str) -> bool {
        self.helpers.contains_key(name)
    }

    fn unregister_helper(&mut self, name: &str) {
        self.helpers.remove(name);
    }

    fn register_partial<N, S>(&mut self, name: N, source: S)
    where
        N: AsRef<str>,
        S: Into<String>,
    {
        self.partials.insert(name.as_ref().to_string(), source.into());
    }

    fn partial(&self, name: &str) -> Option<&str> {
        self.partials.get(name).map(String::as_str)
    }

    fn has_partial(&self, name: &str) -> bool {
        self.partials.contains_key(name)
    }

    fn add_pre_hook<F>(&mut self, hook: F)
    where
        F: Fn(&str, &Context) -> String + Send + Sync + 'static,
    {
        self.pre_hooks.push(Box::new(hook));
    }

    fn add_post_hook<F>(&mut self, hook: F)
    where
        F: Fn(&str, &Context) -> String + Send + Sync + 'static,
    {
        self.post_hooks.push(Box::new(hook));
    }

    /// Parse and render `source` against `context`.
    ///
    /// Pre-hooks transform the raw source before parsing; post-hooks
    /// transform the rendered output. Render-time problems are logged
    /// and contribute empty output, so a template with one broken
    /// fragment still renders the rest.
    ///
    /// # Errors
    /// - If the (pre-processed) source fails to parse.
    ///
    /// # Examples
    ///
    /// ```
    /// use helpmate::{Context, HelpmateEngine, TemplateInterface};
    /// use serde_json::json;
    ///
    /// let engine = HelpmateEngine::new();
    /// let mut context = Context::new();
    /// context.insert("items", json!(["a", "b"]));
    ///
    /// let output = engine
    ///     .render("{{#each items}}- {{this}}\n{{/each}}", &mut context)
    ///     .unwrap();
    /// assert_eq!(output, "- a\n- b\n");
    /// ```
    fn render(&self, source: &str, context: &mut Context) -> HelpmateResult<String> {
        let mut source = source.to_string();
        for hook in &self.pre_hooks {
            source = hook(&source, context);
        }

        let ast = parser::parse(&source)?;

        let scope = RenderScope::new();
        let mut out = String::new();
        render_node(self, &ast, context, &scope, &mut out);

        for hook in &self.post_hooks {
            out = hook(&out, context);
        }
        Ok(out)
    }

    fn render_precompiled(
        &self,
        template_id: &str,
        context: &mut Context,
    ) -> HelpmateResult<String> {
        let compiled =
            self.precompiled
                .get(template_id)
                .ok_or_else(|| HelpmateError::MissingPrecompiled {
                    template_id: template_id.to_string(),
                })?;
        let mut out = compiled.execute(self, context);
        for hook in &self.post_hooks {
            out = hook(&out, context);
        }
        Ok(out)
    }
}
