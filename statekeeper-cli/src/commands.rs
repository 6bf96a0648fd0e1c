//! Command execution.

use crate::Commands;
use colored::Colorize;
use serde_json::Value;
use statekeeper_core::{render_dot, Context, Identity, Profile, State};
use statekeeper_runtime::{Config, Runtime};
use statekeeper_storage::{Storage, StoredRecord};
use std::path::Path;

type CliResult = Result<String, Box<dyn std::error::Error>>;

/// Executes a command and returns the formatted output.
pub fn execute(config: Config, identity: Option<String>, cmd: Commands) -> CliResult {
    let identity = identity.map(Identity::from);
    let identity = identity.as_ref();

    match cmd {
        Commands::Validate => {
            let runtime = schema_runtime(config)?;
            let summaries = runtime.validate()?;
            let mut output = format!("{}\n", "Schema is valid".green());
            for summary in summaries {
                output.push_str(&format!(
                    "  {} ({} states, initial: {})\n",
                    summary.name.cyan(),
                    summary.states.len(),
                    summary.initial_state.yellow()
                ));
            }
            Ok(output.trim_end().to_string())
        }

        Commands::States { machine } => {
            let runtime = schema_runtime(config)?;
            let states = runtime.machine(&machine)?.states()?;
            let mut output = format!("{}\n", format!("Machine {}", machine.cyan()).bold());
            for state in states {
                output.push_str(&format_state(&state));
                output.push('\n');
            }
            Ok(output.trim_end().to_string())
        }

        Commands::Dot { machine, profile } => {
            let runtime = schema_runtime(config)?;
            let profile = match profile {
                Some(path) => load_profile(&path)?,
                None => Profile::default(),
            };
            Ok(render_dot(runtime.machine(&machine)?, &profile)?)
        }

        Commands::PutRecord {
            model,
            pk,
            attrs,
            roles,
        } => {
            let runtime = Runtime::open(config)?;
            let pk = parse_json_arg(&pk)?;
            let mut record = StoredRecord::new(model.clone(), pk.clone());
            if let Some(attrs) = attrs {
                match parse_json_arg(&attrs)? {
                    Value::Object(map) => record.attributes.extend(map),
                    _ => return Err("attributes must be a JSON object".into()),
                }
            }
            for grant in roles {
                let (who, role) = parse_role(&grant)?;
                record = record.with_role(who, role);
            }
            runtime.storage().put_record(record)?;
            runtime.sync()?;
            Ok(format!("{} record {} {}", "Stored".green(), model.cyan(), pk))
        }

        Commands::Init {
            model,
            pk,
            attribute,
        } => {
            let runtime = Runtime::open(config)?;
            let binding = runtime.binding(&model, attribute.as_deref())?;
            let mut subject = runtime.subject(&model, &parse_json_arg(&pk)?)?;
            let ctx = binding.init(&mut subject, identity)?;
            let output = format_outcome("Initialized", &ctx);
            drop(ctx);
            runtime.sync()?;
            Ok(output)
        }

        Commands::Trigger {
            model,
            pk,
            event,
            attribute,
        } => {
            let runtime = Runtime::open(config)?;
            let binding = runtime.binding(&model, attribute.as_deref())?;
            let mut subject = runtime.subject(&model, &parse_json_arg(&pk)?)?;
            let ctx = binding.trigger(&mut subject, event.as_str(), identity)?;
            let output = format_outcome("Triggered", &ctx);
            drop(ctx);
            runtime.sync()?;
            Ok(output)
        }

        Commands::Set {
            model,
            pk,
            value,
            attribute,
        } => {
            let runtime = Runtime::open(config)?;
            let binding = runtime.binding(&model, attribute.as_deref())?;
            let mut subject = runtime.subject(&model, &parse_json_arg(&pk)?)?;
            let output = match binding.set_value(&mut subject, &value, identity)? {
                Some(ctx) => format_outcome("Moved", &ctx),
                None => format!("{}: already in {}", "Unchanged".yellow(), value.yellow()),
            };
            runtime.sync()?;
            Ok(output)
        }

        Commands::Events {
            model,
            pk,
            attribute,
        } => {
            let runtime = Runtime::open(config)?;
            let binding = runtime.binding(&model, attribute.as_deref())?;
            let mut subject = runtime.subject(&model, &parse_json_arg(&pk)?)?;
            let ctx = binding.create_context(&mut subject, identity);
            let state = ctx.current_state()?;
            let events = ctx.possible_events()?;

            let mut output = format!(
                "{} {}\n",
                "State".bold(),
                state.display_label().yellow()
            );
            if events.is_empty() {
                output.push_str(&format!("  {}", "No events available".dimmed()));
            }
            for event in events {
                output.push_str(&format!(
                    "  {} -> {}\n",
                    event.label().cyan(),
                    event.target()
                ));
            }
            Ok(output.trim_end().to_string())
        }

        Commands::Journal {
            model,
            pk,
            attribute,
        } => {
            let runtime = Runtime::open(config)?;
            let pk = parse_json_arg(&pk)?.to_string();
            let attribute = match attribute {
                Some(attr) => Some(runtime.binding(&model, Some(&attr))?.attribute().to_string()),
                None => None,
            };
            let entries: Vec<_> = runtime
                .storage()
                .journal_entries()
                .into_iter()
                .filter(|e| e.concerns(&model, &pk, attribute.as_deref()))
                .collect();

            if entries.is_empty() {
                return Ok("No journal entries".yellow().to_string());
            }
            let mut output = String::new();
            for entry in entries {
                output.push_str(&format!(
                    "  {} {} {} -> {} [{}]{}\n",
                    entry.created_at.to_rfc3339().dimmed(),
                    entry.attribute,
                    entry.from_state.as_deref().unwrap_or("-"),
                    entry.to_state.yellow(),
                    entry.event.as_deref().unwrap_or("-").cyan(),
                    entry
                        .identity
                        .map(|id| format!(" by {}", id))
                        .unwrap_or_default()
                ));
            }
            Ok(output.trim_end().to_string())
        }

        Commands::Timeouts { due } => {
            let runtime = Runtime::open(config)?;
            let now = runtime.clock().now();
            let records: Vec<_> = runtime
                .storage()
                .timeouts()
                .into_iter()
                .filter(|t| !due || t.is_due(now))
                .collect();

            if records.is_empty() {
                return Ok("No scheduled timeouts".yellow().to_string());
            }
            let mut output = String::new();
            for record in records {
                let when = record.expires_at.to_rfc3339();
                let when = if record.is_due(now) {
                    when.red().to_string()
                } else {
                    when
                };
                output.push_str(&format!(
                    "  {} {} {}.{} {} ({})\n",
                    when,
                    record.model.cyan(),
                    record.model_pk,
                    record.virtual_attribute,
                    record.event.yellow(),
                    record.machine
                ));
            }
            Ok(output.trim_end().to_string())
        }

        Commands::Sweep => {
            let runtime = Runtime::open(config)?;
            let report = runtime.sweep()?;
            runtime.sync()?;

            let mut output = format!(
                "{}\n  Due: {}\n  Triggered: {}\n  Rejected: {}\n  Already handled: {}\n  Dropped: {}\n  Stale: {}\n  Unbound: {}",
                if report.is_clean() {
                    "Sweep complete".green()
                } else {
                    "Sweep complete with problems".yellow()
                },
                report.due,
                report.triggered,
                report.rejected,
                report.already_handled,
                report.dropped,
                report.stale,
                report.unbound
            );
            for failure in &report.failures {
                output.push_str(&format!(
                    "\n  {} {} {} {}: {}",
                    "Failed".red(),
                    failure.model,
                    failure.model_pk,
                    failure.event,
                    failure.error
                ));
            }
            Ok(output)
        }

        Commands::DeleteRecord { model, pk } => {
            let runtime = Runtime::open(config)?;
            let pk = parse_json_arg(&pk)?;
            runtime.storage().delete_record(&model, &pk)?;
            runtime.sync()?;
            Ok(format!("{} record {} {}", "Deleted".green(), model.cyan(), pk))
        }
    }
}

/// A runtime for commands that only read the schema.
fn schema_runtime(config: Config) -> Result<Runtime, Box<dyn std::error::Error>> {
    Ok(Runtime::builder(config)
        .with_storage(Storage::in_memory())
        .build()?)
}

fn load_profile(path: &Path) -> Result<Profile, Box<dyn std::error::Error>> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&content)?)
}

/// Formats one state line with its flags and outgoing events.
fn format_state(state: &State) -> String {
    let mut flags = Vec::new();
    if state.is_initial() {
        flags.push("initial");
    }
    if state.is_final() {
        flags.push("final");
    }
    if state.is_intermediate() {
        flags.push("intermediate");
    }

    let mut line = format!("  {}", state.value().yellow());
    if state.display_label() != state.value() {
        line.push_str(&format!(" \"{}\"", state.display_label()));
    }
    line.push_str(&format!(" [{}]", flags.join(", ")));

    for event in state.events(None) {
        line.push_str(&format!("\n    {} -> {}", event.label().cyan(), event.target()));
        if !event.roles().is_empty() {
            line.push_str(&format!(" (roles: {})", event.roles().join(", ")));
        }
    }
    for timeout in state.timeouts() {
        let after = timeout
            .timeout()
            .map(|t| format!("{}s", t.offset().num_seconds()))
            .unwrap_or_default();
        line.push_str(&format!(
            "\n    {} -> {} (timeout {})",
            timeout.label().cyan(),
            timeout.target(),
            after
        ));
    }
    line
}

/// Summarizes a transition context for display.
fn format_outcome(verb: &str, ctx: &Context<'_>) -> String {
    if let Some(e) = ctx.exceptions().first() {
        return format!("{} [{}]: {}", "Failed".red(), e.error_code(), e);
    }
    if ctx.has_errors() {
        return format!("{}: {}", "Rejected".red(), ctx.errors().join("; "));
    }
    format!(
        "{} -> {}",
        verb.green(),
        ctx.current_value().unwrap_or_default().yellow()
    )
}

/// Parses a JSON argument (either inline JSON or @file.json).
///
/// A bare word that is not JSON is taken as a string, so `42` is a number
/// and `abc` is `"abc"`.
fn parse_json_arg(arg: &str) -> Result<Value, Box<dyn std::error::Error>> {
    if let Some(path) = arg.strip_prefix('@') {
        let content = std::fs::read_to_string(path)?;
        return Ok(serde_json::from_str(&content)?);
    }
    match serde_json::from_str(arg) {
        Ok(value) => Ok(value),
        Err(_) if !arg.trim_start().starts_with(['{', '[', '"']) => {
            Ok(Value::String(arg.to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

/// Parses an `identity=role` grant.
fn parse_role(grant: &str) -> Result<(String, String), Box<dyn std::error::Error>> {
    match grant.split_once('=') {
        Some((who, role)) if !who.is_empty() && !role.is_empty() => {
            Ok((who.to_string(), role.to_string()))
        }
        _ => Err(format!("invalid role grant '{}', expected identity=role", grant).into()),
    }
}
