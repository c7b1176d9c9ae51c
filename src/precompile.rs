use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use crate::ast::{Argument, AstNode, SubExpr};
use crate::context::Context;
use crate::engine::HelpmateEngine;
use crate::error::{HelpmateError, HelpmateResult};
use crate::interface::{Continuation, HelperOptions, TemplateInterface};
use crate::parser;
use crate::render::{
    RenderScope, apply_assignment, emit_expression, eval_argument, render_partial_invocation,
};
use crate::value::value_to_string;

/// The helper allow-list for precompilation. `All` disables
/// unknown-helper detection.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum KnownHelpers {
    #[default]
    All,
    Only(BTreeSet<String>),
}

impl KnownHelpers {
    pub fn only<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Only(names.into_iter().map(Into::into).collect())
    }
}

/// Configuration for [`precompile`].
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Default)]
pub struct PrecompileOptions {
    pub known_helpers: KnownHelpers,
    /// Escalate unknown-helper detection from a warning to a hard
    /// failure.
    pub strict: bool,
    /// Key under which the procedure can be registered on an engine for
    /// repeated invocation.
    pub template_id: Option<String>,
    /// Emit best-effort positional metadata (top-level node
    /// granularity).
    pub source_map: bool,
}

/// Best-effort mapping from a compiled step back to its position in the
/// template source.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceMapEntry {
    pub step: usize,
    pub line: usize,
    pub column: usize,
}

type Step = Box<dyn Fn(&HelpmateEngine, &mut Context, &RenderScope, &mut String) + Send + Sync>;
type StepChain = Arc<Vec<Step>>;

/// A template compiled to an executable step chain.
///
/// Executing the chain against a context and an engine's runtime
/// surface (evaluator, helper lookup, partial lookup and registration,
/// sub-render) reproduces the renderer's output byte for byte, without
/// re-parsing or re-walking the tree.
pub struct Precompiled {
    steps: StepChain,
    /// Every helper name the template references, including inside
    /// subexpressions.
    pub used_helpers: BTreeSet<String>,
    /// The original template source.
    pub source: String,
    pub template_id: Option<String>,
    pub source_map: Option<Vec<SourceMapEntry>>,
}

impl std::fmt::Debug for Precompiled {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Precompiled")
            .field("steps", &format_args!("<{} steps>", self.steps.len()))
            .field("used_helpers", &self.used_helpers)
            .field("source", &self.source)
            .field("template_id", &self.template_id)
            .field("source_map", &self.source_map)
            .finish()
    }
}

impl Precompiled {
    /// Run the compiled procedure. Infallible for the same reason
    /// rendering is: per-node failures are logged no-ops.
    pub fn execute(&self, engine: &HelpmateEngine, context: &mut Context) -> String {
        let scope = RenderScope::new();
        let mut out = String::new();
        run_steps(engine, &self.steps, context, &scope, &mut out);
        out
    }
}

fn run_steps(
    engine: &HelpmateEngine,
    steps: &[Step],
    context: &mut Context,
    scope: &RenderScope,
    out: &mut String,
) {
    for step in steps {
        step(engine, context, scope, out);
    }
}

/// Compile a template source ahead of time.
///
/// # Errors
/// - If the source fails to parse.
/// - In strict mode, if a referenced helper is absent from
///   `known_helpers` (built-in block helpers are implicitly known).
pub fn precompile(source: &str, options: &PrecompileOptions) -> HelpmateResult<Precompiled> {
    let mut spans = Vec::new();
    let ast = if options.source_map {
        parser::parse_with_spans(source, &mut spans)?
    } else {
        parser::parse(source)?
    };

    let mut used_helpers = BTreeSet::new();
    collect_used_helpers(&ast, &mut used_helpers);
    check_known_helpers(&used_helpers, options)?;

    let steps = match &ast {
        AstNode::Root(nodes) => compile_nodes(nodes),
        other => Arc::new(vec![compile_node(other)]),
    };
    let source_map = options.source_map.then(|| {
        spans
            .iter()
            .enumerate()
            .map(|(step, (line, column))| SourceMapEntry {
                step,
                line: *line,
                column: *column,
            })
            .collect()
    });

    Ok(Precompiled {
        steps,
        used_helpers,
        source: source.to_string(),
        template_id: options.template_id.clone(),
        source_map,
    })
}

const BUILTIN_HELPERS: [&str; 4] = ["if", "unless", "each", "with"];

fn check_known_helpers(
    used_helpers: &BTreeSet<String>,
    options: &PrecompileOptions,
) -> HelpmateResult<()> {
    let KnownHelpers::Only(known) = &options.known_helpers else {
        return Ok(());
    };
    for name in used_helpers {
        if known.contains(name) || BUILTIN_HELPERS.contains(&name.as_str()) {
            continue;
        }
        if options.strict {
            return Err(HelpmateError::UnknownHelper {
                helper_name: name.clone(),
            });
        }
        warn!(helper = %name, "template references a helper outside known_helpers");
    }
    Ok(())
}

fn collect_used_helpers(node: &AstNode, used: &mut BTreeSet<String>) {
    match node {
        AstNode::Root(children) | AstNode::InlinePartial { children, .. } => {
            for child in children {
                collect_used_helpers(child, used);
            }
        }
        AstNode::BlockHelper {
            name,
            args,
            hash,
            children,
            inverse,
            ..
        } => {
            used.insert(name.clone());
            for argument in args {
                collect_from_argument(argument, used);
            }
            for (_, argument) in hash {
                collect_from_argument(argument, used);
            }
            for child in children {
                collect_used_helpers(child, used);
            }
            if let Some(inverse) = inverse {
                for child in inverse {
                    collect_used_helpers(child, used);
                }
            }
        }
        AstNode::HelperExpression { name, args, hash } => {
            used.insert(name.clone());
            for argument in args {
                collect_from_argument(argument, used);
            }
            for (_, argument) in hash {
                collect_from_argument(argument, used);
            }
        }
        AstNode::Subexpression(sub) => {
            collect_from_sub(sub, used);
        }
        AstNode::Partial { hash, .. } => {
            for (_, argument) in hash {
                collect_from_argument(argument, used);
            }
        }
        AstNode::PartialBlock { hash, children, .. } => {
            for (_, argument) in hash {
                collect_from_argument(argument, used);
            }
            for child in children {
                collect_used_helpers(child, used);
            }
        }
        AstNode::Text { .. }
        | AstNode::Expression { .. }
        | AstNode::Assignment { .. }
        | AstNode::Comment => {}
    }
}

fn collect_from_argument(argument: &Argument, used: &mut BTreeSet<String>) {
    if let Argument::Sub(sub) = argument {
        collect_from_sub(sub, used);
    }
}

fn collect_from_sub(sub: &SubExpr, used: &mut BTreeSet<String>) {
    used.insert(sub.name.clone());
    for argument in &sub.args {
        collect_from_argument(argument, used);
    }
    for (_, argument) in &sub.hash {
        collect_from_argument(argument, used);
    }
}

fn compile_nodes(nodes: &[AstNode]) -> StepChain {
    Arc::new(nodes.iter().map(compile_node).collect())
}

/// One AST node becomes one step. Structure replaces the interpreter's
/// per-node dispatch: names, argument lists and child chains are cloned
/// out of the tree once, and invocation state (buffers, continuations)
/// is allocated fresh per execution so repeated and nested invocations
/// cannot collide.
fn compile_node(node: &AstNode) -> Step {
    match node {
        AstNode::Root(children) => {
            let steps = compile_nodes(children);
            Box::new(move |engine, context, scope, out| {
                run_steps(engine, &steps, context, scope, out);
            })
        }
        AstNode::Text { value } => {
            let value = value.clone();
            Box::new(move |_, _, _, out| out.push_str(&value))
        }
        AstNode::Expression { expression } => {
            let expression = expression.clone();
            Box::new(move |_, context, _, out| emit_expression(&expression, context, out))
        }
        AstNode::Assignment { target, value } => {
            let target = target.clone();
            let value = value.clone();
            Box::new(move |_, context, _, _| apply_assignment(&target, &value, context))
        }
        AstNode::BlockHelper {
            name,
            args,
            hash,
            children,
            inverse,
            self_closing,
        } => {
            let name = name.clone();
            let args = args.to_vec();
            let hash = hash.to_vec();
            // Self-closing blocks compile to an invocation with *no*
            // body chain, so the helper sees the same absent `fn` as in
            // the interpreter.
            let body = (!self_closing).then(|| compile_nodes(children));
            let inverse = inverse.as_ref().map(|nodes| compile_nodes(nodes));
            Box::new(move |engine, context, scope, out| {
                let value = invoke_compiled_helper(
                    engine,
                    context,
                    scope,
                    &name,
                    &args,
                    &hash,
                    body.as_ref(),
                    inverse.as_ref(),
                );
                out.push_str(&value_to_string(&value));
            })
        }
        AstNode::HelperExpression { name, args, hash } => {
            let name = name.clone();
            let args = args.to_vec();
            let hash = hash.to_vec();
            Box::new(move |engine, context, scope, out| {
                let value =
                    invoke_compiled_helper(engine, context, scope, &name, &args, &hash, None, None);
                out.push_str(&value_to_string(&value));
            })
        }
        AstNode::Subexpression(sub) => {
            let sub = sub.clone();
            Box::new(move |engine, context, scope, _| {
                crate::render::invoke_subexpression(engine, context, scope, &sub);
            })
        }
        AstNode::Comment => Box::new(|_, _, _, _| {}),
        AstNode::InlinePartial { name, children } => {
            let name = name.clone();
            let steps = compile_nodes(children);
            Box::new(move |engine, context, scope, _| {
                let mut text = String::new();
                run_steps(engine, &steps, context, scope, &mut text);
                scope.register(&name, text);
            })
        }
        AstNode::Partial {
            name,
            dynamic,
            context: partial_context,
            hash,
        } => {
            let name = name.clone();
            let dynamic = *dynamic;
            let partial_context = partial_context.clone();
            let hash = hash.to_vec();
            Box::new(move |engine, context, scope, out| {
                render_partial_invocation(
                    engine,
                    context,
                    scope,
                    out,
                    &name,
                    dynamic,
                    partial_context.as_deref(),
                    &hash,
                    None,
                );
            })
        }
        AstNode::PartialBlock {
            name,
            dynamic,
            context: partial_context,
            hash,
            children,
        } => {
            let name = name.clone();
            let dynamic = *dynamic;
            let partial_context = partial_context.clone();
            let hash = hash.to_vec();
            let steps = compile_nodes(children);
            Box::new(move |engine, context, scope, out| {
                let block = |ctx: &mut Context, buf: &mut String| {
                    run_steps(engine, &steps, ctx, scope, buf);
                };
                render_partial_invocation(
                    engine,
                    context,
                    scope,
                    out,
                    &name,
                    dynamic,
                    partial_context.as_deref(),
                    &hash,
                    Some(&block),
                );
            })
        }
    }
}

/// The compiled counterpart of the interpreter's helper invocation.
/// Continuations render their chain into a fresh buffer, preserving the
/// surrounding concatenation order exactly as the interpreter does.
fn invoke_compiled_helper(
    engine: &HelpmateEngine,
    context: &mut Context,
    scope: &RenderScope,
    name: &str,
    args: &[Argument],
    hash: &[(String, Argument)],
    body: Option<&StepChain>,
    inverse: Option<&StepChain>,
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

    let body: Option<Continuation<'_>> = body.map(|steps| {
        let steps = Arc::clone(steps);
        Box::new(move |ctx: &mut Context| {
            let mut buf = String::new();
            run_steps(engine, &steps, ctx, scope, &mut buf);
            buf
        }) as Continuation<'_>
    });
    let inverse: Option<Continuation<'_>> = inverse.map(|steps| {
        let steps = Arc::clone(steps);
        Box::new(move |ctx: &mut Context| {
            let mut buf = String::new();
            run_steps(engine, &steps, ctx, scope, &mut buf);
            buf
        }) as Continuation<'_>
    });

    let options = HelperOptions::new(hash_values, body, inverse);
    helper(context, &options, &arg_values)
}
