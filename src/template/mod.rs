//! Username Templates
//!
//! A small `{{ ... }}` templating language for generating database usernames
//! from [`UsernameMetadata`].
//!
//! ## Syntax
//!
//! - Fields: `.DisplayName`, `.RoleName`
//! - Literals: `"quoted"`, `` `raw` ``, integers
//! - Pipes: `.RoleName | truncate 15 | lowercase` (the piped value becomes
//!   the last argument of the next function)
//! - Sub-pipelines in parentheses: `(random 20)`
//! - Trim markers: `{{-` and `-}}` drop adjacent whitespace
//!
//! ## Functions
//!
//! `random N`, `unix_time`, `unix_time_millis`, `timestamp FORMAT`,
//! `truncate N`, `truncate_sha256 N`, `replace OLD NEW`, `lowercase`,
//! `uppercase`, `sha256`, `base64`, `uuid`, `printf FORMAT ARGS...`.
//!
//! A template is validated at construction by rendering it once against
//! empty metadata.

mod funcs;
mod parse;

use std::fmt;
use std::str::FromStr;

use crate::dbplugin::UsernameMetadata;

use funcs::Value;
use parse::{Command, Node, Operand, Pipeline};

/// Produces `v_<display15>_<role15>_<random20>_<unix10>`, lowercased, with
/// hyphens replaced, at most 100 chars.
pub const DEFAULT_USERNAME_TEMPLATE: &str = r#"{{ printf "v_%s_%s_%s_%s" (.DisplayName | truncate 15) (.RoleName | truncate 15) (random 20) (unix_time) | truncate 100 | replace "-" "_" | lowercase }}"#;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error("missing template")]
    Empty,

    #[error("unable to parse template: {0}")]
    Parse(String),

    #[error("unable to apply template: {0}")]
    Execute(String),
}

/// A parsed, validated username template.
#[derive(Clone, PartialEq, Eq)]
pub struct UsernameTemplate {
    source: String,
    nodes: Vec<Node>,
}

impl UsernameTemplate {
    pub fn new(source: &str) -> Result<Self, TemplateError> {
        if source.is_empty() {
            return Err(TemplateError::Empty);
        }
        let template = Self {
            source: source.to_string(),
            nodes: parse::parse(source)?,
        };
        template.generate(&UsernameMetadata::default())?;
        Ok(template)
    }

    /// The built-in [`DEFAULT_USERNAME_TEMPLATE`].
    pub fn standard() -> Result<Self, TemplateError> {
        Self::new(DEFAULT_USERNAME_TEMPLATE)
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Render the template for `metadata`.
    pub fn generate(&self, metadata: &UsernameMetadata) -> Result<String, TemplateError> {
        let mut out = String::new();
        for node in &self.nodes {
            match node {
                Node::Text(text) => out.push_str(text),
                Node::Action(pipeline) => {
                    out.push_str(&eval_pipeline(pipeline, metadata)?.to_string());
                }
            }
        }
        Ok(out)
    }
}

impl FromStr for UsernameTemplate {
    type Err = TemplateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl fmt::Debug for UsernameTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("UsernameTemplate").field(&self.source).finish()
    }
}

// ============================================================================
// Evaluation
// ============================================================================

fn eval_pipeline(pipeline: &Pipeline, metadata: &UsernameMetadata) -> Result<Value, TemplateError> {
    let mut piped: Option<Value> = None;
    for command in &pipeline.commands {
        piped = Some(eval_command(command, piped.take(), metadata)?);
    }
    piped.ok_or_else(|| TemplateError::Execute("empty pipeline".to_string()))
}

fn eval_command(
    command: &Command,
    piped: Option<Value>,
    metadata: &UsernameMetadata,
) -> Result<Value, TemplateError> {
    let (first, rest) = command
        .operands
        .split_first()
        .ok_or_else(|| TemplateError::Execute("empty command".to_string()))?;

    let Operand::Func(name) = first else {
        if !rest.is_empty() {
            return Err(TemplateError::Execute(format!(
                "can't give argument to non-function {first:?}"
            )));
        }
        if piped.is_some() {
            return Err(TemplateError::Execute(format!(
                "can't pipe into non-function {first:?}"
            )));
        }
        return eval_operand(first, metadata);
    };

    if !funcs::is_known(name) {
        return Err(TemplateError::Execute(format!("function {name:?} not defined")));
    }
    let mut args = rest
        .iter()
        .map(|op| eval_operand(op, metadata))
        .collect::<Result<Vec<_>, _>>()?;
    if let Some(value) = piped {
        args.push(value);
    }
    funcs::call(name, args)
}

fn eval_operand(operand: &Operand, metadata: &UsernameMetadata) -> Result<Value, TemplateError> {
    match operand {
        Operand::Field(name) => match name.as_str() {
            "DisplayName" => Ok(Value::Str(metadata.display_name.clone())),
            "RoleName" => Ok(Value::Str(metadata.role_name.clone())),
            other => Err(TemplateError::Execute(format!(
                "can't evaluate field {other} in username metadata"
            ))),
        },
        Operand::Str(s) => Ok(Value::Str(s.clone())),
        Operand::Int(n) => Ok(Value::Int(*n)),
        Operand::Func(name) => funcs::call(name, Vec::new()),
        Operand::Sub(pipeline) => eval_pipeline(pipeline, metadata),
    }
}
