use serde_json::Value;

use crate::context::{Context, ContextOverlay};
use crate::interface::HelperOptions;
use crate::value::truthy;

/// `{{#if cond}}...{{else}}...{{/if}}`
pub(crate) fn helper_if(
    context: &mut Context,
    options: &HelperOptions<'_>,
    args: &[Value],
) -> Value {
    let pass = args.first().is_some_and(truthy);
    let rendered = if pass {
        options.body(context)
    } else {
        options.inverse(context)
    };
    Value::String(rendered.unwrap_or_default())
}

/// `{{#unless cond}}...{{/unless}}`
pub(crate) fn helper_unless(
    context: &mut Context,
    options: &HelperOptions<'_>,
    args: &[Value],
) -> Value {
    let pass = !args.first().is_some_and(truthy);
    let rendered = if pass {
        options.body(context)
    } else {
        options.inverse(context)
    };
    Value::String(rendered.unwrap_or_default())
}

/// `{{#each items}}...{{else}}...{{/each}}`
///
/// Iterates sequences and maps by overlaying `this`, `@index`, `@first`,
/// `@last` (and `@key` for maps) on the shared context, restoring the
/// prior values synchronously before returning. An empty or
/// non-iterable argument renders the `{{else}}` body.
pub(crate) fn helper_each(
    context: &mut Context,
    options: &HelperOptions<'_>,
    args: &[Value],
) -> Value {
    let mut out = String::new();
    match args.first() {
        Some(Value::Array(items)) if !items.is_empty() => {
            let len = items.len();
            let mut overlay = ContextOverlay::new();
            for (index, item) in items.iter().enumerate() {
                overlay.set(context, "this", item.clone());
                overlay.set(context, "@index", Value::from(index));
                overlay.set(context, "@first", Value::Bool(index == 0));
                overlay.set(context, "@last", Value::Bool(index + 1 == len));
                if let Some(body) = options.body(context) {
                    out.push_str(&body);
                }
            }
            overlay.restore(context);
        }
        Some(Value::Object(map)) if !map.is_empty() => {
            let len = map.len();
            let mut overlay = ContextOverlay::new();
            for (index, (key, item)) in map.iter().enumerate() {
                overlay.set(context, "this", item.clone());
                overlay.set(context, "@key", Value::String(key.clone()));
                overlay.set(context, "@index", Value::from(index));
                overlay.set(context, "@first", Value::Bool(index == 0));
                overlay.set(context, "@last", Value::Bool(index + 1 == len));
                if let Some(body) = options.body(context) {
                    out.push_str(&body);
                }
            }
            overlay.restore(context);
        }
        _ => {
            return Value::String(options.inverse(context).unwrap_or_default());
        }
    }
    Value::String(out)
}

/// `{{#with obj}}...{{else}}...{{/with}}`
///
/// Overlays the object's keys plus `this` on the shared context for the
/// duration of the body, restoring afterwards. A falsy argument renders
/// the `{{else}}` body.
pub(crate) fn helper_with(
    context: &mut Context,
    options: &HelperOptions<'_>,
    args: &[Value],
) -> Value {
    match args.first() {
        Some(value) if truthy(value) => {
            let mut overlay = ContextOverlay::new();
            if let Value::Object(map) = value {
                for (key, entry) in map {
                    overlay.set(context, key, entry.clone());
                }
            }
            overlay.set(context, "this", value.clone());
            let rendered = options.body(context).unwrap_or_default();
            overlay.restore(context);
            Value::String(rendered)
        }
        _ => Value::String(options.inverse(context).unwrap_or_default()),
    }
}
