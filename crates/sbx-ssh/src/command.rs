//! The single shell command that launches a process on a machine.

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::{Error, Result};

/// Project root on every machine.
pub const WORKDIR: &str = "/workspace";

/// Where the decoded environment is written before being sourced.
pub const ENV_FILE: &str = "/tmp/.sandbox-env";

/// Render `env` as `export KEY='value'` lines and base64 the result, so no
/// value ever passes through the remote shell's parser unquoted.
pub fn encode_env(env: &BTreeMap<String, String>) -> Result<String> {
    let mut script = String::new();
    for (key, value) in env {
        if !is_valid_name(key) {
            return Err(Error::InvalidEnvName(key.clone()));
        }
        script.push_str("export ");
        script.push_str(key);
        script.push('=');
        script.push_str(&single_quote(value));
        script.push('\n');
    }
    Ok(STANDARD.encode(script))
}

/// Decode the env into [`ENV_FILE`], source it, enter `workdir`, then `exec`
/// the program so its exit status becomes the session's.
pub fn launch_command(
    env: &BTreeMap<String, String>,
    workdir: &str,
    program: &str,
) -> Result<String> {
    let payload = encode_env(env)?;
    Ok(format!(
        "echo {payload} | base64 -d > {ENV_FILE} && . {ENV_FILE} && cd {} && exec {program}",
        single_quote(workdir),
    ))
}

fn is_valid_name(key: &str) -> bool {
    let mut chars = key.chars();
    matches!(chars.next(), Some(c) if c == '_' || c.is_ascii_alphabetic())
        && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

fn single_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
