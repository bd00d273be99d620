//! Built-in template functions.
//!
//! A piped value is passed as the last argument, so `.RoleName | truncate 15`
//! calls `truncate 15 <role>`.

use std::fmt;

use base64::Engine as _;
use chrono::format::{Item, StrftimeItems};
use chrono::Utc;
use rand::Rng;
use sha2::{Digest, Sha256};

use crate::template::TemplateError;

const BASE62: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Value {
    Str(String),
    Int(i64),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => f.write_str(s),
            Value::Int(n) => write!(f, "{n}"),
        }
    }
}

fn exec_error(msg: String) -> TemplateError {
    TemplateError::Execute(msg)
}

fn arity(name: &str, args: &[Value], want: usize) -> Result<(), TemplateError> {
    if args.len() != want {
        return Err(exec_error(format!(
            "wrong number of args for {name}: want {want} got {}",
            args.len()
        )));
    }
    Ok(())
}

fn int_arg(name: &str, value: &Value) -> Result<i64, TemplateError> {
    match value {
        Value::Int(n) => Ok(*n),
        Value::Str(s) => Err(exec_error(format!(
            "{name}: expected integer argument, got {s:?}"
        ))),
    }
}

fn len_arg(name: &str, value: &Value) -> Result<usize, TemplateError> {
    let n = int_arg(name, value)?;
    usize::try_from(n).map_err(|_| exec_error(format!("{name}: length must be non-negative")))
}

pub(crate) fn is_known(name: &str) -> bool {
    matches!(
        name,
        "random"
            | "unix_time"
            | "unix_time_millis"
            | "timestamp"
            | "truncate"
            | "truncate_sha256"
            | "replace"
            | "lowercase"
            | "uppercase"
            | "sha256"
            | "base64"
            | "uuid"
            | "printf"
    )
}

pub(crate) fn call(name: &str, args: Vec<Value>) -> Result<Value, TemplateError> {
    match name {
        "random" => {
            arity(name, &args, 1)?;
            let n = len_arg(name, &args[0])?;
            if n == 0 {
                return Err(exec_error("random: length must be at least 1".to_string()));
            }
            Ok(Value::Str(random_base62(n)))
        }
        "unix_time" => {
            arity(name, &args, 0)?;
            Ok(Value::Str(Utc::now().timestamp().to_string()))
        }
        "unix_time_millis" => {
            arity(name, &args, 0)?;
            Ok(Value::Str(Utc::now().timestamp_millis().to_string()))
        }
        "timestamp" => {
            arity(name, &args, 1)?;
            let format = args[0].to_string();
            let items: Vec<Item<'_>> = StrftimeItems::new(&format).collect();
            if items.iter().any(|item| matches!(item, Item::Error)) {
                return Err(exec_error(format!("timestamp: invalid format {format:?}")));
            }
            Ok(Value::Str(
                Utc::now().format_with_items(items.into_iter()).to_string(),
            ))
        }
        "truncate" => {
            arity(name, &args, 2)?;
            let n = len_arg(name, &args[0])?;
            Ok(Value::Str(args[1].to_string().chars().take(n).collect()))
        }
        "truncate_sha256" => {
            arity(name, &args, 2)?;
            let n = len_arg(name, &args[0])?;
            Ok(Value::Str(truncate_sha256(n, &args[1].to_string())?))
        }
        "replace" => {
            arity(name, &args, 3)?;
            let input = args[2].to_string();
            Ok(Value::Str(
                input.replace(&args[0].to_string(), &args[1].to_string()),
            ))
        }
        "lowercase" => {
            arity(name, &args, 1)?;
            Ok(Value::Str(args[0].to_string().to_lowercase()))
        }
        "uppercase" => {
            arity(name, &args, 1)?;
            Ok(Value::Str(args[0].to_string().to_uppercase()))
        }
        "sha256" => {
            arity(name, &args, 1)?;
            Ok(Value::Str(sha256_hex(&args[0].to_string())))
        }
        "base64" => {
            arity(name, &args, 1)?;
            Ok(Value::Str(
                base64::engine::general_purpose::STANDARD.encode(args[0].to_string()),
            ))
        }
        "uuid" => {
            arity(name, &args, 0)?;
            Ok(Value::Str(uuid::Uuid::new_v4().to_string()))
        }
        "printf" => {
            let Some((format, rest)) = args.split_first() else {
                return Err(exec_error("printf: missing format".to_string()));
            };
            Ok(Value::Str(printf(&format.to_string(), rest)?))
        }
        other => Err(exec_error(format!("function {other:?} not defined"))),
    }
}

fn random_base62(n: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..n)
        .map(|_| BASE62[rng.gen_range(0..BASE62.len())] as char)
        .collect()
}

fn sha256_hex(input: &str) -> String {
    Sha256::digest(input.as_bytes())
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Keep the first `max - 8` chars and append 8 hex chars of the SHA-256 of
/// the rest.
fn truncate_sha256(max: usize, input: &str) -> Result<String, TemplateError> {
    if input.chars().count() <= max {
        return Ok(input.to_string());
    }
    if max <= 8 {
        return Err(exec_error(
            "truncate_sha256: max length must be greater than 8".to_string(),
        ));
    }
    let keep: String = input.chars().take(max - 8).collect();
    let tail: String = input.chars().skip(max - 8).collect();
    Ok(format!("{keep}{}", &sha256_hex(&tail)[..8]))
}

fn printf(format: &str, args: &[Value]) -> Result<String, TemplateError> {
    let mut out = String::new();
    let mut args = args.iter();
    let mut chars = format.chars();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('%') => out.push('%'),
            Some(verb @ ('s' | 'v' | 'd')) => {
                let arg = args
                    .next()
                    .ok_or_else(|| exec_error(format!("printf: missing argument for %{verb}")))?;
                if verb == 'd' {
                    let n = match arg {
                        Value::Int(n) => *n,
                        Value::Str(s) => s.parse::<i64>().map_err(|_| {
                            exec_error(format!("printf: %d expects an integer, got {s:?}"))
                        })?,
                    };
                    out.push_str(&n.to_string());
                } else {
                    out.push_str(&arg.to_string());
                }
            }
            Some(other) => {
                return Err(exec_error(format!("printf: unsupported verb %{other}")));
            }
            None => return Err(exec_error("printf: trailing %".to_string())),
        }
    }
    if args.next().is_some() {
        return Err(exec_error("printf: too many arguments".to_string()));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(v: &str) -> Value {
        Value::Str(v.to_string())
    }

    #[test]
    fn test_truncate_counts_chars() {
        let out = call("truncate", vec![Value::Int(3), s("héllo")]).unwrap();
        assert_eq!(out, s("hél"));
    }

    #[test]
    fn test_truncate_sha256() {
        let short = call("truncate_sha256", vec![Value::Int(20), s("short")]).unwrap();
        assert_eq!(short, s("short"));

        let long = call(
            "truncate_sha256",
            vec![Value::Int(12), s("averyveryverylongname")],
        )
        .unwrap();
        assert_eq!(long.to_string().len(), 12);
        assert!(long.to_string().starts_with("aver"));
    }

    #[test]
    fn test_random_is_base62() {
        let out = call("random", vec![Value::Int(32)]).unwrap().to_string();
        assert_eq!(out.len(), 32);
        assert!(out.chars().all(|c| c.is_ascii_alphanumeric()));
        assert!(call("random", vec![Value::Int(0)]).is_err());
    }

    #[test]
    fn test_printf_verbs() {
        let out = printf("%s-%d-%v-100%%", &[s("a"), Value::Int(7), s("b")]).unwrap();
        assert_eq!(out, "a-7-b-100%");
        assert!(printf("%s %s", &[s("a")]).is_err());
        assert!(printf("%q", &[s("a")]).is_err());
    }

    #[test]
    fn test_misc_functions() {
        assert_eq!(call("uppercase", vec![s("ab")]).unwrap(), s("AB"));
        assert_eq!(call("base64", vec![s("ab")]).unwrap(), s("YWI="));
        assert_eq!(
            call("replace", vec![s("-"), s("_"), s("a-b-c")]).unwrap(),
            s("a_b_c")
        );
        assert_eq!(call("sha256", vec![s("")]).unwrap().to_string().len(), 64);
        assert!(call("timestamp", vec![s("%Y-%m-%d")]).is_ok());
        assert!(call("nope", vec![]).is_err());
    }
}
