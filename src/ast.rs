/// An argument to a helper invocation: either a raw expression span to be
/// evaluated at render time, or a nested parenthesized subexpression.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Argument {
    Expression(String),
    Sub(SubExpr),
}

/// A parenthesized helper call used as an argument value,
/// e.g. `(concat first last)`. Subexpressions nest arbitrarily.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SubExpr {
    pub name: String,
    pub args: Vec<Argument>,
    pub hash: Vec<(String, Argument)>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum AstNode {
    /// The top of a parsed template. Holds only children.
    Root(Vec<AstNode>),
    /// A literal run of text, escapes already processed.
    Text { value: String },
    /// `{{expr}}` - evaluated and stringified into the output.
    Expression { expression: String },
    /// `{{ target = expr }}` - mutates the context, produces no output.
    Assignment { target: String, value: String },
    /// `{{#name args hash=..}}...{{else}}...{{/name}}`.
    ///
    /// Self-closing blocks (`{{#name args/}}`) have empty children, no
    /// inverse, and `self_closing` set; the helper is then invoked
    /// without body continuations.
    BlockHelper {
        name: String,
        args: Vec<Argument>,
        hash: Vec<(String, Argument)>,
        children: Vec<AstNode>,
        inverse: Option<Vec<AstNode>>,
        self_closing: bool,
    },
    /// `{{name arg1 arg2 hash=..}}` - a bodiless helper call in
    /// expression position.
    HelperExpression {
        name: String,
        args: Vec<Argument>,
        hash: Vec<(String, Argument)>,
    },
    /// A subexpression promoted to node position. The parser only
    /// produces these nested inside arguments; a top-level one renders
    /// nothing.
    Subexpression(SubExpr),
    /// `{{> name}}` or `{{> (expr)}}` when `dynamic`.
    Partial {
        name: String,
        dynamic: bool,
        context: Option<String>,
        hash: Vec<(String, Argument)>,
    },
    /// `{{#> name}}...failover...{{/name}}`.
    PartialBlock {
        name: String,
        dynamic: bool,
        context: Option<String>,
        hash: Vec<(String, Argument)>,
        children: Vec<AstNode>,
    },
    /// `{{#*inline "name"}}...{{/inline}}`.
    InlinePartial { name: String, children: Vec<AstNode> },
    /// `{{! ... }}` - no output.
    Comment,
}
