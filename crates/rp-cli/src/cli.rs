use std::path::PathBuf;

use clap::{Parser, Subcommand};
use rp_db::SqlValue;

#[derive(Parser, Debug)]
#[command(name = "repodb", version, about = "Render and run SQL templates against the configured pool")]
pub struct Cli {
    /// Configuration file (default: the file named by CONFIG_PATH)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Render a statement template offline, using the configured table map
    Render {
        /// Statement template, e.g. "SELECT * FROM table(user) WHERE id={id}"
        template: String,

        /// Parameters as key=value; values that parse as JSON are typed
        #[arg(value_parser = parse_param)]
        params: Vec<(String, SqlValue)>,
    },

    /// Run a statement in its own operation and print the result as JSON
    Query {
        template: String,

        #[arg(value_parser = parse_param)]
        params: Vec<(String, SqlValue)>,

        /// Wrap the statement in a transaction
        #[arg(short, long)]
        transaction: bool,
    },

    /// Check that a connection can be opened
    Ping,
}

/// Parse `key=value`. The value is JSON when it parses as JSON, text otherwise.
pub fn parse_param(arg: &str) -> Result<(String, SqlValue), String> {
    let (key, raw) = arg
        .split_once('=')
        .ok_or_else(|| format!("invalid parameter `{arg}`, expected key=value"))?;
    if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(format!("invalid parameter name `{key}`"));
    }

    let value = serde_json::from_str::<serde_json::Value>(raw)
        .map(SqlValue::from)
        .unwrap_or_else(|_| SqlValue::Text(raw.to_string()));
    Ok((key.to_string(), value))
}
