//! The shell's command tree and handlers.

use crate::state::ShellState;
use crate::syntax::{dispatch, render_help, tokenize, HandlerResult, SyntaxNode};
use pimdb_codec::Value;
use pimdb_core::{ModelResult, Query, QueryRunner};
use std::path::Path;
use std::sync::Arc;

/// Builds the shell's command tree.
#[must_use]
pub fn command_tree() -> Vec<SyntaxNode> {
    vec![
        SyntaxNode::command("help", "list available commands", cmd_help),
        SyntaxNode::command("open", "open <root> <instance>: open a resource", cmd_open),
        SyntaxNode::command("stat", "show revision and database statistics", cmd_stat),
        SyntaxNode::command("list", "list <type> [property value]: query entities", cmd_list),
        SyntaxNode::command("count", "count <type>: count live entities", cmd_count),
        SyntaxNode::command("exit", "leave the shell", cmd_exit),
    ]
}

/// Tokenizes and dispatches one input line.
pub fn run_line(input: &str, state: &mut ShellState) -> HandlerResult {
    let tokens = tokenize(input);
    if tokens.is_empty() {
        return Ok(String::new());
    }
    dispatch(&command_tree(), &tokens, state)
}

fn cmd_help(_args: &[String], _state: &mut ShellState) -> HandlerResult {
    Ok(render_help(&command_tree(), 0))
}

fn cmd_open(args: &[String], state: &mut ShellState) -> HandlerResult {
    let [root, instance] = args else {
        return Err("usage: open <root> <instance>".to_string());
    };
    *state = ShellState::open(Path::new(root), instance)?;
    Ok(format!("opened {instance}"))
}

fn cmd_stat(_args: &[String], state: &mut ShellState) -> HandlerResult {
    let resource = state.require_resource()?;
    let revision = resource
        .max_revision()
        .map_err(|error| error.to_string())?;
    let mut out = format!("instance: {}\nmax revision: {revision}\n", resource.instance_id());
    out.push_str("databases:\n");
    for name in resource.env().database_names() {
        out.push_str(&format!("  {name}\n"));
    }
    Ok(out)
}

fn run_query(state: &mut ShellState, query: Query) -> Result<ModelResult, String> {
    let resource = state.require_resource()?;
    let mut runner = QueryRunner::new(
        Arc::clone(resource.env()),
        resource.store().clone(),
        query,
        resource.notifier(),
    );
    let mut model = ModelResult::new();
    runner
        .run_initial(&mut model)
        .map_err(|error| error.to_string())?;
    Ok(model)
}

fn cmd_list(args: &[String], state: &mut ShellState) -> HandlerResult {
    let Some(entity_type) = args.first() else {
        return Err("usage: list <type> [property value]".to_string());
    };
    let mut query = Query::of_type(entity_type.clone());
    if let [_, property, value] = args {
        query = query.filter_eq(property.clone(), Value::Text(value.clone()));
    }

    let model = run_query(state, query)?;
    let mut out = String::new();
    for entity in model.entities() {
        out.push_str(&format!("{} ", entity.id));
        let mut first = true;
        for (name, value) in &entity.properties {
            if !first {
                out.push_str(", ");
            }
            out.push_str(&format!("{name}={value}"));
            first = false;
        }
        out.push('\n');
    }
    out.push_str(&format!("{} rows\n", model.row_count()));
    Ok(out)
}

fn cmd_count(args: &[String], state: &mut ShellState) -> HandlerResult {
    let Some(entity_type) = args.first() else {
        return Err("usage: count <type>".to_string());
    };
    let model = run_query(state, Query::of_type(entity_type.clone()))?;
    Ok(format!("{}\n", model.row_count()))
}

fn cmd_exit(_args: &[String], state: &mut ShellState) -> HandlerResult {
    state.exit_requested = true;
    Ok("bye".to_string())
}
