//! Shell command dispatch.
//!
//! Commands form a tagged tree of keyword nodes; a pure matcher walks
//! the tree over the tokenized input and hands the remaining tokens to
//! the matched node's handler.

use crate::state::ShellState;

/// Outcome of a handler.
pub type HandlerResult = Result<String, String>;

/// Handler for a matched command.
pub type Handler = fn(&[String], &mut ShellState) -> HandlerResult;

/// Whether a command interacts beyond a single response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interactivity {
    /// Prints and returns.
    Simple,
    /// Keeps the shell busy (watch-style commands).
    Interactive,
}

/// One node in the command tree.
pub struct SyntaxNode {
    /// The keyword this node matches.
    pub keyword: &'static str,
    /// One-line help text.
    pub help: &'static str,
    /// Interactivity class.
    pub interactivity: Interactivity,
    /// Handler invoked when this node is the deepest match.
    pub handler: Option<Handler>,
    /// Sub-commands.
    pub children: Vec<SyntaxNode>,
}

impl SyntaxNode {
    /// A leaf command.
    #[must_use]
    pub fn command(keyword: &'static str, help: &'static str, handler: Handler) -> Self {
        Self {
            keyword,
            help,
            interactivity: Interactivity::Simple,
            handler: Some(handler),
            children: Vec::new(),
        }
    }

    /// A group node that only routes to children.
    #[must_use]
    pub fn group(keyword: &'static str, help: &'static str, children: Vec<SyntaxNode>) -> Self {
        Self {
            keyword,
            help,
            interactivity: Interactivity::Simple,
            handler: None,
            children,
        }
    }
}

/// Splits input on whitespace.
///
/// TODO: quoted tokens are not handled; "a b" tokenizes as two words.
#[must_use]
pub fn tokenize(input: &str) -> Vec<String> {
    input.split_whitespace().map(ToString::to_string).collect()
}

/// Walks the tree over the tokens; the deepest keyword match wins and
/// receives the unconsumed tokens as arguments.
pub fn dispatch(nodes: &[SyntaxNode], tokens: &[String], state: &mut ShellState) -> HandlerResult {
    let Some(first) = tokens.first() else {
        return Err("empty command".to_string());
    };
    let Some(node) = nodes.iter().find(|node| node.keyword == first.as_str()) else {
        return Err(format!("unknown command: {first}"));
    };

    let rest = &tokens[1..];
    if !node.children.is_empty() {
        if let Some(next) = rest.first() {
            if node
                .children
                .iter()
                .any(|child| child.keyword == next.as_str())
            {
                return dispatch(&node.children, rest, state);
            }
        }
    }
    match node.handler {
        Some(handler) => handler(rest, state),
        None => Err(format!(
            "{} needs a sub-command: {}",
            node.keyword,
            node.children
                .iter()
                .map(|child| child.keyword)
                .collect::<Vec<_>>()
                .join(", ")
        )),
    }
}

/// Renders help for a command tree.
#[must_use]
pub fn render_help(nodes: &[SyntaxNode], indent: usize) -> String {
    let mut out = String::new();
    for node in nodes {
        out.push_str(&format!(
            "{}{:<12} {}\n",
            " ".repeat(indent),
            node.keyword,
            node.help
        ));
        out.push_str(&render_help(&node.children, indent + 2));
    }
    out
}
