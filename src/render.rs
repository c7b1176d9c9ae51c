use std::cell::RefCell;
use std::collections::BTreeMap;

use serde_json::Value;
use tracing::warn;

use crate::ast::{Argument, AstNode, SubExpr};
use crate::context::Context;
use crate::engine::HelpmateEngine;
use crate::eval;
use crate::interface::{Continuation, HelperOptions, TemplateInterface};
use crate::parser;
use crate::value::value_to_string;

/// Call-scoped store of inline partials.
///
/// One scope is created per render call and threaded through the whole
/// walk, so inline partials defined during a render are visible for the
/// remainder of that call and invisible to any other render in flight
/// on the same engine. Registrations form a stack: the most recent
/// registration under a name wins, and `@partial-block` is pushed and
/// popped around each partial-block evaluation.
pub(crate) struct RenderScope {
    inline: RefCell<Vec<(String, String)>>,
}

impl RenderScope {
    pub(crate) fn new() -> Self {
        Self {
            inline: RefCell::new(Vec::new()),
        }
    }

    pub(crate) fn register(&self, name: &str, source: String) {
        self.inline.borrow_mut().push((name.to_string(), source));
    }

    pub(crate) fn unregister(&self, name: &str) {
        let mut inline = self.inline.borrow_mut();
        if let Some(index) = inline.iter().rposition(|(n, _)| n == name) {
            inline.remove(index);
        }
    }

    pub(crate) fn lookup(&self, name: &str) -> Option<String> {
        self.inline
            .borrow()
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, source)| source.clone())
    }
}

pub(crate) fn render_nodes(
    engine: &HelpmateEngine,
    nodes: &[AstNode],
    context: &mut Context,
    scope: &RenderScope,
    out: &mut String,
) {
    for node in nodes {
        render_node(engine, node, context, scope, out);
    }
}

pub(crate) fn render_node(
    engine: &HelpmateEngine,
    node: &AstNode,
    context: &mut Context,
    scope: &RenderScope,
    out: &mut String,
) {
    match node {
        AstNode::Root(children) => {
            render_nodes(engine, children, context, scope, out);
        }
        AstNode::Text { value } => {
            out.push_str(value);
        }
        AstNode::Expression { expression } => {
            emit_expression(expression, context, out);
        }
        AstNode::Assignment { target, value } => {
            apply_assignment(target, value, context);
        }
        AstNode::BlockHelper {
            name,
            args,
            hash,
            children,
            inverse,
            self_closing,
        } => {
            let body = if *self_closing {
                None
            } else {
                Some(children.as_slice())
            };
            let value = invoke_helper(
                engine,
                context,
                scope,
                name,
                args,
                hash,
                body,
                inverse.as_deref(),
            );
            out.push_str(&value_to_string(&value));
        }
        AstNode::HelperExpression { name, args, hash } => {
            let value = invoke_helper(engine, context, scope, name, args, hash, None, None);
            out.push_str(&value_to_string(&value));
        }
        // Resolved like a helper call, but a subexpression's value is
        // only meaningful in argument position: at node position it is
        // invoked (helpers may mutate the context) and discarded.
        AstNode::Subexpression(sub) => {
            invoke_subexpression(engine, context, scope, sub);
        }
        AstNode::Comment => {}
        AstNode::InlinePartial { name, children } => {
            let mut text = String::new();
            render_nodes(engine, children, context, scope, &mut text);
            scope.register(name, text);
        }
        AstNode::Partial {
            name,
            dynamic,
            context: partial_context,
            hash,
        } => {
            render_partial_invocation(
                engine,
                context,
                scope,
                out,
                name,
                *dynamic,
                partial_context.as_deref(),
                hash,
                None,
            );
        }
        AstNode::PartialBlock {
            name,
            dynamic,
            context: partial_context,
            hash,
            children,
        } => {
            let block = |ctx: &mut Context, buf: &mut String| {
                render_nodes(engine, children, ctx, scope, buf);
            };
            render_partial_invocation(
                engine,
                context,
                scope,
                out,
                name,
                *dynamic,
                partial_context.as_deref(),
                hash,
                Some(&block),
            );
        }
    }
}

/// Evaluate an expression node and append its stringified value. A
/// failing evaluation logs and contributes nothing.
pub(crate) fn emit_expression(expression: &str, context: &mut Context, out: &mut String) {
    match eval::evaluate(expression, context) {
        Ok(value) => out.push_str(&value_to_string(&value)),
        Err(error) => {
            warn!(expression = %expression, error = %error, "expression evaluation failed");
        }
    }
}

/// Evaluate an assignment's right-hand side and write it into the
/// context at the target path.
pub(crate) fn apply_assignment(target: &str, value: &str, context: &mut Context) {
    match eval::evaluate(value, context) {
        Ok(value) => context.set_path(target, value),
        Err(error) => {
            warn!(target = %target, error = %error, "assignment evaluation failed");
        }
    }
}

/// Evaluate a helper argument: a raw expression span, or a nested
/// subexpression resolved as a helper call.
pub(crate) fn eval_argument(
    engine: &HelpmateEngine,
    context: &mut Context,
    scope: &RenderScope,
    argument: &Argument,
) -> Value {
    match argument {
        Argument::Expression(text) => match eval::evaluate(text, context) {
            Ok(value) => value,
            Err(error) => {
                warn!(expression = %text, error = %error, "argument evaluation failed");
                Value::Null
            }
        },
        Argument::Sub(sub) => invoke_subexpression(engine, context, scope, sub),
    }
}

/// A subexpression resolves like a helper call but its value is passed
/// through unstringified.
pub(crate) fn invoke_subexpression(
    engine: &HelpmateEngine,
    context: &mut Context,
    scope: &RenderScope,
    sub: &SubExpr,
) -> Value {
    invoke_helper(engine, context, scope, &sub.name, &sub.args, &sub.hash, None, None)
}

/// Resolve and invoke a helper. A missing helper is a logged no-op.
/// `children`/`inverse` become the `fn`/`inverse` continuations; both
/// are absent for helper expressions, subexpressions and self-closing
/// blocks.
pub(crate) fn invoke_helper(
    engine: &HelpmateEngine,
    context: &mut Context,
    scope: &RenderScope,
    name: &str,
    args: &[Argument],
    hash: &[(String, Argument)],
    children: Option<&[AstNode]>,
    inverse: Option<&[AstNode]>,
) -> Value {
    let Some(helper) = engine.helper(name) else {
        warn!(helper = %name, "helper not registered; rendering nothing");
        return Value::Null;
    };
    let arg_values: Vec<Value> = args
        .iter()
        .map(|argument| eval_argument(engine, context, scope, argument))
        .collect();
    let hash_values: BTreeMap<String, Value> = hash
        .iter()
        .map(|(key, argument)| (key.clone(), eval_argument(engine, context, scope, argument)))
        .collect();

    let body: Option<Continuation<'_>> = children.map(|nodes| {
        Box::new(move |ctx: &mut Context| {
            let mut buf = String::new();
            render_nodes(engine, nodes, ctx, scope, &mut buf);
            buf
        }) as Continuation<'_>
    });
    let inverse: Option<Continuation<'_>> = inverse.map(|nodes| {
        Box::new(move |ctx: &mut Context| {
            let mut buf = String::new();
            render_nodes(engine, nodes, ctx, scope, &mut buf);
            buf
        }) as Continuation<'_>
    });

    let options = HelperOptions::new(hash_values, body, inverse);
    helper(context, &options, &arg_values)
}

/// Render a `{{> ...}}` or `{{#> ...}}` invocation.
///
/// `block` is the partial block's body renderer; it doubles as failover
/// content when the partial is unresolved and as the `@partial-block`
/// inline partial when it resolves. Plain partials pass `None` and an
/// unresolved name is a logged no-op.
pub(crate) fn render_partial_invocation(
    engine: &HelpmateEngine,
    context: &mut Context,
    scope: &RenderScope,
    out: &mut String,
    name: &str,
    dynamic: bool,
    partial_context: Option<&str>,
    hash: &[(String, Argument)],
    block: Option<&dyn Fn(&mut Context, &mut String)>,
) {
    let resolved = if dynamic {
        match eval::evaluate(name, context) {
            Ok(value) => {
                let resolved = value_to_string(&value);
                if resolved.is_empty() {
                    warn!(expression = %name, "dynamic partial name evaluated to nothing");
                    return;
                }
                resolved
            }
            Err(error) => {
                warn!(expression = %name, error = %error, "dynamic partial name failed to evaluate");
                return;
            }
        }
    } else {
        name.to_string()
    };

    let source = scope
        .lookup(&resolved)
        .or_else(|| engine.partial_source(&resolved));
    let Some(source) = source else {
        match block {
            Some(render_block) => render_block(context, out),
            None => warn!(partial = %resolved, "partial not registered; rendering nothing"),
        }
        return;
    };

    let ast = match parser::parse(&source) {
        Ok(ast) => ast,
        Err(error) => {
            warn!(partial = %resolved, error = %error, "partial failed to parse; rendering nothing");
            return;
        }
    };

    // The block body renders against the caller's context, then becomes
    // available to the partial as `{{> @partial-block}}`.
    if let Some(render_block) = block {
        let mut block_text = String::new();
        render_block(context, &mut block_text);
        scope.register("@partial-block", block_text);
    }

    let substituted = partial_context.and_then(|expr| match eval::evaluate(expr, context) {
        Ok(Value::Null) => None,
        Ok(Value::Object(map)) => Some(Context::from_value(Value::Object(map))),
        Ok(other) => {
            let mut focused = Context::new();
            focused.insert("this", other);
            Some(focused)
        }
        Err(error) => {
            warn!(expression = %expr, error = %error, "partial context failed to evaluate");
            None
        }
    });

    // Hash parameters are evaluated against the caller's context; a
    // value that evaluates to nothing falls back to its literal text.
    let hash_values: Vec<(String, Value)> = hash
        .iter()
        .map(|(key, argument)| {
            let value = match argument {
                Argument::Expression(text) => match eval::evaluate(text, context) {
                    Ok(Value::Null) | Err(_) => Value::String(text.clone()),
                    Ok(value) => value,
                },
                Argument::Sub(sub) => invoke_subexpression(engine, context, scope, sub),
            };
            (key.clone(), value)
        })
        .collect();

    match substituted {
        Some(mut partial_ctx) => {
            for (key, value) in hash_values {
                partial_ctx.insert(key, value);
            }
            render_node(engine, &ast, &mut partial_ctx, scope, out);
        }
        None if hash_values.is_empty() => {
            render_node(engine, &ast, context, scope, out);
        }
        None => {
            // Hash parameters overlay a copy so they stay scoped to the
            // partial render.
            let mut partial_ctx = context.clone();
            for (key, value) in hash_values {
                partial_ctx.insert(key, value);
            }
            render_node(engine, &ast, &mut partial_ctx, scope, out);
        }
    }

    if block.is_some() {
        scope.unregister("@partial-block");
    }
}
