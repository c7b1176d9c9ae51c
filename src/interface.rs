use std::collections::BTreeMap;

use serde_json::Value;

use crate::HelpmateResult;
use crate::context::Context;

/// A render continuation handed to block helpers: renders the block body
/// (or its `{{else}}` body) against a caller-supplied context.
pub type Continuation<'a> = Box<dyn Fn(&mut Context) -> String + 'a>;

/// A registered helper. Helpers receive the render context, their
/// invocation options and the evaluated positional arguments, and return
/// a value: stringified when the call stands alone in the template,
/// passed through unchanged when it appears as a subexpression.
pub type Helper = dyn Fn(&mut Context, &HelperOptions<'_>, &[Value]) -> Value + Send + Sync;

/// A pre- or post-processing hook: a pure text transform over the raw
/// source (before parsing) or the rendered output (after rendering).
pub type Hook = Box<dyn Fn(&str, &Context) -> String + Send + Sync>;

/// Per-invocation options for a helper call.
///
/// `body`/`inverse` are absent for helper expressions, subexpressions
/// and self-closing blocks; that absence is how a helper detects it was
/// called without a body.
pub struct HelperOptions<'a> {
    hash: BTreeMap<String, Value>,
    body: Option<Continuation<'a>>,
    inverse: Option<Continuation<'a>>,
}

impl<'a> HelperOptions<'a> {
    pub(crate) fn new(
        hash: BTreeMap<String, Value>,
        body: Option<Continuation<'a>>,
        inverse: Option<Continuation<'a>>,
    ) -> Self {
        Self {
            hash,
            body,
            inverse,
        }
    }

    /// Evaluated named parameters from the invocation.
    pub fn hash(&self, name: &str) -> Option<&Value> {
        self.hash.get(name)
    }

    pub fn hash_map(&self) -> &BTreeMap<String, Value> {
        &self.hash
    }

    /// Whether the helper was invoked with a block body.
    pub fn has_body(&self) -> bool {
        self.body.is_some()
    }

    /// Render the block body against `context`. `None` when the helper
    /// was called without a body.
    pub fn body(&self, context: &mut Context) -> Option<String> {
        self.body.as_ref().map(|render| render(context))
    }

    /// Render the `{{else}}` body against `context`. `None` when the
    /// block has no inverse.
    pub fn inverse(&self, context: &mut Context) -> Option<String> {
        self.inverse.as_ref().map(|render| render(context))
    }
}

/// The engine surface for the helpmate templating system: a registry of
/// named helpers and partials, textual pre/post hooks, and the render
/// entry points.
pub trait TemplateInterface {
    /// Register (or replace) a helper under `name`. Helpers may be
    /// registered at any time before or during a render call.
    fn register_helper<N, F>(&mut self, name: N, helper: F)
    where
        N: AsRef<str>,
        F: Fn(&mut Context, &HelperOptions<'_>, &[Value]) -> Value + Send + Sync + 'static;

    /// Look up a registered helper by name.
    fn helper(&self, name: &str) -> Option<&Helper>;

    fn has_helper(&self, name: &str) -> bool;

    fn unregister_helper(&mut self, name: &str);

    /// Register (or replace) a global partial: a named reusable template
    /// body that persists for the engine's lifetime.
    fn register_partial<N, S>(&mut self, name: N, source: S)
    where
        N: AsRef<str>,
        S: Into<String>;

    /// Look up a *global* partial's source. Inline partials are scoped
    /// to the render call that defined them and are not visible here.
    fn partial(&self, name: &str) -> Option<&str>;

    fn has_partial(&self, name: &str) -> bool;

    /// Append a hook applied to raw source text before parsing.
    fn add_pre_hook<F>(&mut self, hook: F)
    where
        F: Fn(&str, &Context) -> String + Send + Sync + 'static;

    /// Append a hook applied to rendered output after rendering.
    fn add_post_hook<F>(&mut self, hook: F)
    where
        F: Fn(&str, &Context) -> String + Send + Sync + 'static;

    /// Parse and render `source` against `context`.
    ///
    /// # Errors
    /// - If the template fails to parse. Render-time problems (missing
    ///   helpers, missing partials, failing expressions) are non-fatal
    ///   and logged instead.
    fn render(&self, source: &str, context: &mut Context) -> HelpmateResult<String>;

    /// Execute a previously registered precompiled template.
    ///
    /// # Errors
    /// - If no procedure was registered under `template_id`.
    fn render_precompiled(&self, template_id: &str, context: &mut Context)
    -> HelpmateResult<String>;
}
