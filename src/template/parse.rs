//! Lexer and parser for `{{ ... }}` username templates.
//!
//! Grammar inside an action:
//!
//! ```text
//! pipeline := command ('|' command)*
//! command  := operand+
//! operand  := FIELD | STRING | INT | IDENT | '(' pipeline ')'
//! ```

use crate::template::TemplateError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Node {
    Text(String),
    Action(Pipeline),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Pipeline {
    pub commands: Vec<Command>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Command {
    pub operands: Vec<Operand>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Operand {
    Field(String),
    Str(String),
    Int(i64),
    Func(String),
    Sub(Pipeline),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Field(String),
    Str(String),
    Int(i64),
    Ident(String),
    Pipe,
    LParen,
    RParen,
}

// ============================================================================
// Text / Action Splitting
// ============================================================================

pub(crate) fn parse(source: &str) -> Result<Vec<Node>, TemplateError> {
    let mut nodes = Vec::new();
    let mut rest = source;
    let mut trim_next_text = false;

    while !rest.is_empty() {
        let Some(open) = rest.find("{{") else {
            push_text(&mut nodes, rest, trim_next_text);
            break;
        };

        let mut text = &rest[..open];
        if trim_next_text {
            text = text.trim_start();
        }
        let mut body_start = open + 2;
        if is_left_trim(&rest[body_start..]) {
            text = text.trim_end();
            body_start += 1;
        }
        push_text(&mut nodes, text, false);

        let after_open = &rest[body_start..];
        let close = find_action_end(after_open).ok_or_else(|| parse_error("unclosed action"))?;
        let mut body = &after_open[..close];
        trim_next_text = false;
        if let Some(stripped) = body.strip_suffix('-') {
            if stripped.ends_with(char::is_whitespace) {
                body = stripped;
                trim_next_text = true;
            }
        }

        let tokens = lex(body)?;
        if tokens.is_empty() {
            return Err(parse_error("missing value for command"));
        }
        let mut pos = 0;
        let pipeline = parse_pipeline(&tokens, &mut pos)?;
        if pos != tokens.len() {
            return Err(parse_error(&format!("unexpected {:?} in action", tokens[pos])));
        }
        nodes.push(Node::Action(pipeline));

        rest = &after_open[close + 2..];
    }
    Ok(nodes)
}

/// Byte offset of the first `}}` outside a quoted or raw string.
fn find_action_end(body: &str) -> Option<usize> {
    let bytes = body.as_bytes();
    let mut quote = None;
    let mut i = 0;
    while i < bytes.len() {
        match (quote, bytes[i]) {
            (Some(b'"'), b'\\') => i += 1,
            (Some(q), b) if b == q => quote = None,
            (Some(_), _) => {}
            (None, b'"' | b'`') => quote = Some(bytes[i]),
            (None, b'}') if bytes.get(i + 1) == Some(&b'}') => return Some(i),
            (None, _) => {}
        }
        i += 1;
    }
    None
}

/// `{{-` only trims when followed by whitespace, so `{{-3}}` stays a number.
fn is_left_trim(body: &str) -> bool {
    let mut chars = body.chars();
    chars.next() == Some('-') && chars.next().is_some_and(char::is_whitespace)
}

fn push_text(nodes: &mut Vec<Node>, text: &str, trim_start: bool) {
    let text = if trim_start { text.trim_start() } else { text };
    if !text.is_empty() {
        nodes.push(Node::Text(text.to_string()));
    }
}

fn parse_error(msg: &str) -> TemplateError {
    TemplateError::Parse(msg.to_string())
}

// ============================================================================
// Lexer
// ============================================================================

fn lex(body: &str) -> Result<Vec<Token>, TemplateError> {
    let chars: Vec<char> = body.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '|' => {
                tokens.push(Token::Pipe);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '"' => {
                let (s, next) = lex_quoted(&chars, i + 1)?;
                tokens.push(Token::Str(s));
                i = next;
            }
            '`' => {
                let end = chars[i + 1..]
                    .iter()
                    .position(|&c| c == '`')
                    .ok_or_else(|| parse_error("unterminated raw string"))?;
                tokens.push(Token::Str(chars[i + 1..i + 1 + end].iter().collect()));
                i += end + 2;
            }
            '.' => {
                let (name, next) = lex_ident(&chars, i + 1);
                if name.is_empty() {
                    return Err(parse_error("dot without field name"));
                }
                tokens.push(Token::Field(name));
                i = next;
            }
            c if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(char::is_ascii_digit)) => {
                let start = i;
                i += 1;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text
                    .parse::<i64>()
                    .map_err(|_| parse_error(&format!("invalid number {text}")))?;
                tokens.push(Token::Int(n));
            }
            c if c.is_alphabetic() || c == '_' => {
                let (name, next) = lex_ident(&chars, i);
                tokens.push(Token::Ident(name));
                i = next;
            }
            other => return Err(parse_error(&format!("unexpected character {other:?}"))),
        }
    }
    Ok(tokens)
}

fn lex_ident(chars: &[char], start: usize) -> (String, usize) {
    let mut end = start;
    while end < chars.len() && (chars[end].is_alphanumeric() || chars[end] == '_') {
        end += 1;
    }
    (chars[start..end].iter().collect(), end)
}

fn lex_quoted(chars: &[char], start: usize) -> Result<(String, usize), TemplateError> {
    let mut out = String::new();
    let mut i = start;
    while i < chars.len() {
        match chars[i] {
            '"' => return Ok((out, i + 1)),
            '\\' => {
                let escaped = chars
                    .get(i + 1)
                    .ok_or_else(|| parse_error("unterminated quoted string"))?;
                out.push(match escaped {
                    'n' => '\n',
                    't' => '\t',
                    '\\' => '\\',
                    '"' => '"',
                    other => return Err(parse_error(&format!("unknown escape \\{other}"))),
                });
                i += 2;
            }
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    Err(parse_error("unterminated quoted string"))
}

// ============================================================================
// Parser
// ============================================================================

fn parse_pipeline(tokens: &[Token], pos: &mut usize) -> Result<Pipeline, TemplateError> {
    let mut commands = vec![parse_command(tokens, pos)?];
    while tokens.get(*pos) == Some(&Token::Pipe) {
        *pos += 1;
        commands.push(parse_command(tokens, pos)?);
    }
    Ok(Pipeline { commands })
}

fn parse_command(tokens: &[Token], pos: &mut usize) -> Result<Command, TemplateError> {
    let mut operands = Vec::new();
    while let Some(token) = tokens.get(*pos) {
        let operand = match token {
            Token::Pipe | Token::RParen => break,
            Token::Field(name) => Operand::Field(name.clone()),
            Token::Str(s) => Operand::Str(s.clone()),
            Token::Int(n) => Operand::Int(*n),
            Token::Ident(name) => Operand::Func(name.clone()),
            Token::LParen => {
                *pos += 1;
                let inner = parse_pipeline(tokens, pos)?;
                if tokens.get(*pos) != Some(&Token::RParen) {
                    return Err(parse_error("unclosed left paren"));
                }
                Operand::Sub(inner)
            }
        };
        operands.push(operand);
        *pos += 1;
    }
    if operands.is_empty() {
        return Err(parse_error("missing command"));
    }
    Ok(Command { operands })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_and_actions() {
        let nodes = parse("a{{.DisplayName}}b").unwrap();
        assert_eq!(nodes.len(), 3);
        assert_eq!(nodes[0], Node::Text("a".to_string()));
        assert!(matches!(&nodes[1], Node::Action(p) if p.commands.len() == 1));
    }

    #[test]
    fn test_trim_markers() {
        let nodes = parse("a  {{- .RoleName -}}  b").unwrap();
        assert_eq!(nodes[0], Node::Text("a".to_string()));
        assert_eq!(nodes[2], Node::Text("b".to_string()));
    }

    #[test]
    fn test_pipes_and_parens() {
        let nodes = parse(r#"{{ printf "%s_%s" (.DisplayName | truncate 3) (random 2) | lowercase }}"#)
            .unwrap();
        let Node::Action(pipeline) = &nodes[0] else {
            panic!("expected action");
        };
        assert_eq!(pipeline.commands.len(), 2);
        assert_eq!(pipeline.commands[0].operands.len(), 4);
        assert!(matches!(&pipeline.commands[0].operands[2], Operand::Sub(p) if p.commands.len() == 2));
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse("{{ .DisplayName").is_err());
        assert!(parse("{{ }}").is_err());
        assert!(parse("{{ (lowercase }}").is_err());
        assert!(parse(r#"{{ "abc }}"#).is_err());
        assert!(parse("{{ lowercase | }}").is_err());
    }
}
