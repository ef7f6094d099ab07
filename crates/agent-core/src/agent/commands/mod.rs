//! Command registry and parser: locating `!command(...)` invocations in free
//! text, validating arguments against declared parameter specs, and
//! dispatching to handlers.

pub mod actions;
pub mod queries;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;

use super::Agent;
use crate::world::NameCatalog;

/// Command names carry this prefix, e.g. `!goToPlayer`.
pub const PREFIX: char = '!';

#[derive(Debug, Error, PartialEq)]
pub enum CommandError {
    #[error("command '{0}' is already registered")]
    DuplicateCommand(String),
    #[error("Command '{0}' does not exist.")]
    UnknownCommand(String),
    #[error("Command {command}: argument '{param}' {reason}")]
    ArgumentType {
        command: String,
        param: String,
        reason: String,
    },
    #[error("Command {command}: argument '{param}' must be within [{min}, {max}], got {value}")]
    ArgumentDomain {
        command: String,
        param: String,
        min: f64,
        max: f64,
        value: f64,
    },
    #[error("Command {command} expects {expected} argument(s), got {got}")]
    Arity {
        command: String,
        expected: usize,
        got: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgType {
    Str,
    Int,
    Float,
    Bool,
    /// Enumerated block name resolved against the external catalog.
    BlockName,
    /// Enumerated item name resolved against the external catalog.
    ItemName,
}

/// A validated positional argument.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl Arg {
    pub fn str(&self) -> anyhow::Result<&str> {
        match self {
            Arg::Str(s) => Ok(s),
            other => anyhow::bail!("expected string argument, got {other:?}"),
        }
    }

    pub fn int(&self) -> anyhow::Result<i64> {
        match self {
            Arg::Int(v) => Ok(*v),
            other => anyhow::bail!("expected integer argument, got {other:?}"),
        }
    }

    pub fn float(&self) -> anyhow::Result<f64> {
        match self {
            Arg::Float(v) => Ok(*v),
            Arg::Int(v) => Ok(*v as f64),
            other => anyhow::bail!("expected float argument, got {other:?}"),
        }
    }

    pub fn boolean(&self) -> anyhow::Result<bool> {
        match self {
            Arg::Bool(v) => Ok(*v),
            other => anyhow::bail!("expected boolean argument, got {other:?}"),
        }
    }

    /// Domain-checked positive count, safe to hand to world primitives.
    pub fn count(&self) -> anyhow::Result<u32> {
        Ok(self.int()?.clamp(1, u32::MAX as i64) as u32)
    }
}

#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub name: &'static str,
    pub ty: ArgType,
    pub description: &'static str,
    /// Inclusive numeric range.
    pub domain: Option<(f64, f64)>,
    /// Normalize the sign with `abs` before the domain check. Applied only
    /// where the command documents it, never as a general rule.
    pub abs: bool,
}

impl ParamSpec {
    pub fn new(name: &'static str, ty: ArgType, description: &'static str) -> Self {
        Self {
            name,
            ty,
            description,
            domain: None,
            abs: false,
        }
    }

    pub fn domain(mut self, min: f64, max: f64) -> Self {
        self.domain = Some((min, max));
        self
    }

    pub fn abs(mut self) -> Self {
        self.abs = true;
        self
    }
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<Option<String>>> + Send>>;
pub type Handler = Arc<dyn Fn(Arc<Agent>, Vec<Arg>) -> HandlerFuture + Send + Sync>;

pub struct CommandSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub params: Vec<ParamSpec>,
    /// Literal usage-line override for the docs; derived from params if absent.
    pub format: Option<&'static str>,
    /// Actions act on the world; queries only read.
    pub action: bool,
    pub handler: Handler,
}

/// Per-agent registry; no shared global, so multiple agents can coexist in
/// one process. Iteration order is registration order, which keeps the docs
/// deterministic.
#[derive(Default)]
pub struct CommandRegistry {
    commands: Vec<CommandSpec>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, spec: CommandSpec) -> Result<(), CommandError> {
        if self.commands.iter().any(|c| c.name == spec.name) {
            return Err(CommandError::DuplicateCommand(spec.name.to_string()));
        }
        self.commands.push(spec);
        Ok(())
    }

    pub fn exists(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<&CommandSpec> {
        self.commands.iter().find(|c| c.name == name)
    }

    pub fn is_action(&self, name: &str) -> bool {
        self.get(name).map(|c| c.action).unwrap_or(false)
    }

    /// One usage line per command, in registration order.
    pub fn docs(&self) -> String {
        self.commands
            .iter()
            .map(|c| {
                let usage = match c.format {
                    Some(format) => format.to_string(),
                    None if c.params.is_empty() => c.name.to_string(),
                    None => {
                        let params: Vec<&str> = c.params.iter().map(|p| p.name).collect();
                        format!("{}({})", c.name, params.join(", "))
                    }
                };
                format!("{usage}: {}", c.description)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Extracts args in declared order, coerces each to its declared type,
    /// rejects out-of-domain values, then calls the handler. Handler errors
    /// are caught here and converted to a textual result so a bad command
    /// never terminates the message loop.
    pub async fn validate_and_invoke(
        &self,
        agent: &Arc<Agent>,
        name: &str,
        raw_args: Option<&str>,
    ) -> Result<Option<String>, CommandError> {
        let spec = self
            .get(name)
            .ok_or_else(|| CommandError::UnknownCommand(name.to_string()))?;
        let args = coerce_args(spec, raw_args, agent.catalog.as_ref())?;
        match (spec.handler)(agent.clone(), args).await {
            Ok(message) => Ok(message),
            Err(err) => Ok(Some(format!("Error executing {name}: {err:#}"))),
        }
    }
}

/// A command invocation located in free text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation<'a> {
    pub name: &'a str,
    pub args: Option<&'a str>,
    /// Byte offset just past the invocation; everything after it is
    /// discarded before logging/execution.
    pub end: usize,
}

/// Finds the first `!word` token in `text`, with its argument list if a
/// balanced parenthesized list immediately follows. Matching is
/// case-sensitive and position-independent; the name must appear verbatim
/// with the `!` prefix.
pub fn find_invocation(text: &str) -> Option<Invocation<'_>> {
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == PREFIX as u8 {
            let name_start = i;
            let mut j = i + 1;
            while j < bytes.len() && (bytes[j].is_ascii_alphanumeric() || bytes[j] == b'_') {
                j += 1;
            }
            if j > i + 1 {
                let name = &text[name_start..j];
                if j < bytes.len() && bytes[j] == b'(' {
                    if let Some(close) = find_closing_paren(text, j) {
                        return Some(Invocation {
                            name,
                            args: Some(&text[j + 1..close]),
                            end: close + 1,
                        });
                    }
                }
                return Some(Invocation {
                    name,
                    args: None,
                    end: j,
                });
            }
        }
        i += 1;
    }
    None
}

pub fn find_command(text: &str) -> Option<&str> {
    find_invocation(text).map(|inv| inv.name)
}

/// Discards everything after the first located invocation. Only one command
/// is ever executed per model turn.
pub fn truncate_after_command(text: &str) -> String {
    match find_invocation(text) {
        Some(inv) => text[..inv.end].to_string(),
        None => text.to_string(),
    }
}

fn find_closing_paren(text: &str, open: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut quote: Option<u8> = None;
    for (idx, &b) in bytes.iter().enumerate().skip(open + 1) {
        match quote {
            Some(q) => {
                if b == q {
                    quote = None;
                }
            }
            None => match b {
                b'"' | b'\'' => quote = Some(b),
                b')' => return Some(idx),
                _ => {}
            },
        }
    }
    None
}

/// Splits a raw argument list on top-level commas, respecting quotes.
fn split_args(raw: &str) -> Vec<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    for ch in trimmed.chars() {
        match quote {
            Some(q) => {
                if ch == q {
                    quote = None;
                }
                current.push(ch);
            }
            None => match ch {
                '"' | '\'' => {
                    quote = Some(ch);
                    current.push(ch);
                }
                ',' => {
                    parts.push(current.trim().to_string());
                    current.clear();
                }
                _ => current.push(ch),
            },
        }
    }
    parts.push(current.trim().to_string());
    parts
}

fn unquote(raw: &str) -> &str {
    let raw = raw.trim();
    if raw.len() >= 2 {
        let first = raw.chars().next().unwrap_or(' ');
        if (first == '"' || first == '\'') && raw.ends_with(first) {
            return &raw[1..raw.len() - 1];
        }
    }
    raw
}

pub fn coerce_args(
    spec: &CommandSpec,
    raw_args: Option<&str>,
    catalog: &dyn NameCatalog,
) -> Result<Vec<Arg>, CommandError> {
    let parts = raw_args.map(split_args).unwrap_or_default();
    if parts.len() != spec.params.len() {
        return Err(CommandError::Arity {
            command: spec.name.to_string(),
            expected: spec.params.len(),
            got: parts.len(),
        });
    }

    let mut args = Vec::with_capacity(parts.len());
    for (param, raw) in spec.params.iter().zip(parts) {
        args.push(coerce_one(spec.name, param, &raw, catalog)?);
    }
    Ok(args)
}

fn coerce_one(
    command: &str,
    param: &ParamSpec,
    raw: &str,
    catalog: &dyn NameCatalog,
) -> Result<Arg, CommandError> {
    let type_err = |reason: String| CommandError::ArgumentType {
        command: command.to_string(),
        param: param.name.to_string(),
        reason,
    };

    match param.ty {
        ArgType::Str => Ok(Arg::Str(unquote(raw).to_string())),
        ArgType::BlockName => {
            let name = unquote(raw);
            if !catalog.is_block(name) {
                return Err(type_err(format!("'{name}' is not a known block name")));
            }
            Ok(Arg::Str(name.to_string()))
        }
        ArgType::ItemName => {
            let name = unquote(raw);
            if !catalog.is_item(name) {
                return Err(type_err(format!("'{name}' is not a known item name")));
            }
            Ok(Arg::Str(name.to_string()))
        }
        ArgType::Int => {
            let mut value: i64 = raw
                .parse()
                .map_err(|_| type_err(format!("must be an integer, got '{raw}'")))?;
            if param.abs {
                value = value.saturating_abs();
            }
            check_domain(command, param, value as f64)?;
            Ok(Arg::Int(value))
        }
        ArgType::Float => {
            let mut value: f64 = raw
                .parse()
                .map_err(|_| type_err(format!("must be a number, got '{raw}'")))?;
            if param.abs {
                value = value.abs();
            }
            check_domain(command, param, value)?;
            Ok(Arg::Float(value))
        }
        ArgType::Bool => match raw.to_ascii_lowercase().as_str() {
            "true" => Ok(Arg::Bool(true)),
            "false" => Ok(Arg::Bool(false)),
            _ => Err(type_err(format!("must be true or false, got '{raw}'"))),
        },
    }
}

fn check_domain(command: &str, param: &ParamSpec, value: f64) -> Result<(), CommandError> {
    if let Some((min, max)) = param.domain {
        if value < min || value > max {
            return Err(CommandError::ArgumentDomain {
                command: command.to_string(),
                param: param.name.to_string(),
                min,
                max,
                value,
            });
        }
    }
    Ok(())
}

/// Locates and runs the command in `text` against the agent, converting any
/// registry-level rejection to a human-readable one-liner. Returns `None`
/// when there is no output to relay.
pub async fn execute_command(agent: &Arc<Agent>, text: &str) -> Option<String> {
    let inv = find_invocation(text)?;
    // The borrow of `text` ends here; handlers may mutate agent state freely.
    let (name, args) = (inv.name.to_string(), inv.args.map(str::to_string));
    match agent
        .registry
        .validate_and_invoke(agent, &name, args.as_deref())
        .await
    {
        Ok(message) => message,
        Err(err) => Some(err.to_string()),
    }
}

pub fn default_registry() -> Result<CommandRegistry, CommandError> {
    let mut registry = CommandRegistry::new();
    actions::register_all(&mut registry)?;
    queries::register_all(&mut registry)?;
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::StaticCatalog;

    fn dummy_handler() -> Handler {
        Arc::new(|_agent, _args| Box::pin(async { Ok(None) }))
    }

    fn spec(name: &'static str, params: Vec<ParamSpec>) -> CommandSpec {
        CommandSpec {
            name,
            description: "test command",
            params,
            format: None,
            action: true,
            handler: dummy_handler(),
        }
    }

    #[test]
    fn find_bare_command() {
        let inv = find_invocation("I'll check my !stats now").unwrap();
        assert_eq!(inv.name, "!stats");
        assert_eq!(inv.args, None);
    }

    #[test]
    fn find_command_with_args_and_truncate_tail() {
        let text = "Sure! !goToPlayer(Steve, 2.5) and then some trailing chatter";
        let inv = find_invocation(text).unwrap();
        assert_eq!(inv.name, "!goToPlayer");
        assert_eq!(inv.args, Some("Steve, 2.5"));
        assert_eq!(
            truncate_after_command(text),
            "Sure! !goToPlayer(Steve, 2.5)"
        );
    }

    #[test]
    fn unbalanced_parens_match_name_only() {
        let inv = find_invocation("try !stop( now").unwrap();
        assert_eq!(inv.name, "!stop");
        assert_eq!(inv.args, None);
        assert_eq!(truncate_after_command("try !stop( now"), "try !stop");
    }

    #[test]
    fn quoted_args_keep_commas_and_parens() {
        let inv = find_invocation("!rememberHere(\"my, (cozy) base\")").unwrap();
        assert_eq!(inv.args, Some("\"my, (cozy) base\""));
        let parts = split_args(inv.args.unwrap());
        assert_eq!(parts, vec!["\"my, (cozy) base\""]);
        assert_eq!(unquote(&parts[0]), "my, (cozy) base");
    }

    #[test]
    fn no_command_in_plain_chat() {
        assert!(find_invocation("nice weather today! isn't it").is_none());
    }

    #[test]
    fn register_rejects_duplicates() {
        let mut reg = CommandRegistry::new();
        reg.register(spec("!stop", vec![])).unwrap();
        let err = reg.register(spec("!stop", vec![])).unwrap_err();
        assert_eq!(err, CommandError::DuplicateCommand("!stop".to_string()));
    }

    #[test]
    fn coerce_types_and_domains() {
        let catalog = StaticCatalog::default();
        let s = spec(
            "!givePlayer",
            vec![
                ParamSpec::new("player_name", ArgType::Str, "who"),
                ParamSpec::new("item_name", ArgType::ItemName, "what"),
                ParamSpec::new("num", ArgType::Int, "how many")
                    .domain(1.0, f64::INFINITY)
                    .abs(),
            ],
        );

        let args = coerce_args(&s, Some("Steve, bread, 3"), &catalog).unwrap();
        assert_eq!(
            args,
            vec![
                Arg::Str("Steve".to_string()),
                Arg::Str("bread".to_string()),
                Arg::Int(3)
            ]
        );

        // Sign normalization happens before the domain check.
        let args = coerce_args(&s, Some("Steve, bread, -2"), &catalog).unwrap();
        assert_eq!(args[2], Arg::Int(2));

        let err = coerce_args(&s, Some("Steve, bread, many"), &catalog).unwrap_err();
        assert!(matches!(err, CommandError::ArgumentType { .. }));

        let err = coerce_args(&s, Some("Steve, unobtainium, 1"), &catalog).unwrap_err();
        assert!(matches!(err, CommandError::ArgumentType { .. }));

        let err = coerce_args(&s, Some("Steve, bread"), &catalog).unwrap_err();
        assert!(matches!(err, CommandError::Arity { expected: 3, got: 2, .. }));
    }

    #[test]
    fn domain_rejects_without_abs() {
        let catalog = StaticCatalog::default();
        let s = spec(
            "!setVolume",
            vec![ParamSpec::new("level", ArgType::Float, "loudness").domain(0.0, 10.0)],
        );
        let err = coerce_args(&s, Some("-3"), &catalog).unwrap_err();
        assert!(matches!(err, CommandError::ArgumentDomain { .. }));
    }

    #[test]
    fn bool_coercion() {
        let catalog = StaticCatalog::default();
        let s = spec(
            "!setMode",
            vec![
                ParamSpec::new("mode_name", ArgType::Str, "which"),
                ParamSpec::new("on", ArgType::Bool, "enable"),
            ],
        );
        let args = coerce_args(&s, Some("hunting, True"), &catalog).unwrap();
        assert_eq!(args[1], Arg::Bool(true));
        assert!(coerce_args(&s, Some("hunting, yes"), &catalog).is_err());
    }

    #[test]
    fn docs_follow_registration_order() {
        let mut reg = CommandRegistry::new();
        reg.register(spec(
            "!goToPlayer",
            vec![
                ParamSpec::new("player_name", ArgType::Str, "who"),
                ParamSpec::new("closeness", ArgType::Float, "how close"),
            ],
        ))
        .unwrap();
        reg.register(spec("!stop", vec![])).unwrap();

        let docs = reg.docs();
        let lines: Vec<&str> = docs.lines().collect();
        assert!(lines[0].starts_with("!goToPlayer(player_name, closeness):"));
        assert!(lines[1].starts_with("!stop:"));
    }
}
