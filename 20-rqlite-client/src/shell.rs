//! Command parsing for the interactive shell.
//!
//! Turns a line such as `q SELECT * FROM foo` into a [`ShellCommand`]. The SQL
//! after the command word is kept verbatim, including its spacing and case.

use anyhow::{Result, anyhow};

use crate::config::ConsistencyLevel;

/// Commands accepted at the shell prompt.
#[derive(Debug, PartialEq)]
pub enum ShellCommand {
    Query { sql: String },
    Exec { sql: String },
    Leader,
    Peers,
    Level { level: ConsistencyLevel },
    Help,
    Exit,
}

pub const HELP: &str = "\
Commands (case-insensitive):
  QUERY <sql>                 (alias: q)  -- run a read and print rows
  EXEC <sql>                  (alias: x)  -- run a write and print the outcome
  LEADER                      (alias: l)  -- show the current leader
  PEERS                       (alias: p)  -- show every peer in request order
  LEVEL <none|weak|strong>                -- change the read consistency level
  HELP                        (alias: h)  -- show this message
  EXIT                        (alias: e)  -- close the connection and quit";

impl ShellCommand {
    /// Parses one line of input.
    ///
    /// The first word is the command (case-insensitive, aliases allowed);
    /// everything after it is the argument.
    pub fn parse(line: &str) -> Result<Self> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Err(anyhow!("empty command"));
        }

        let (word, rest) = match trimmed.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (trimmed, ""),
        };

        let cmd = word.to_uppercase();
        let normalized_cmd = match cmd.as_str() {
            "Q" => "QUERY",
            "X" => "EXEC",
            "L" => "LEADER",
            "P" => "PEERS",
            "H" => "HELP",
            "E" => "EXIT",
            other => other,
        };

        match (normalized_cmd, rest.is_empty()) {
            ("EXIT", true) => Ok(ShellCommand::Exit),
            ("HELP", true) => Ok(ShellCommand::Help),
            ("LEADER", true) => Ok(ShellCommand::Leader),
            ("PEERS", true) => Ok(ShellCommand::Peers),
            ("QUERY", false) => Ok(ShellCommand::Query {
                sql: rest.to_string(),
            }),
            ("EXEC", false) => Ok(ShellCommand::Exec {
                sql: rest.to_string(),
            }),
            ("LEVEL", false) => Ok(ShellCommand::Level {
                level: rest.parse().map_err(|err| anyhow!("{err}"))?,
            }),
            ("QUERY", true) => Err(anyhow!("QUERY requires SQL: QUERY <sql>")),
            ("EXEC", true) => Err(anyhow!("EXEC requires SQL: EXEC <sql>")),
            ("LEVEL", true) => Err(anyhow!("LEVEL requires one of: none, weak, strong")),
            ("EXIT" | "HELP" | "LEADER" | "PEERS", false) => {
                Err(anyhow!("{normalized_cmd} takes no arguments"))
            }
            _ => Err(anyhow!(
                "invalid command. Try: QUERY/q <sql>, EXEC/x <sql>, LEADER/l, PEERS/p, LEVEL <level>, HELP/h, EXIT/e"
            )),
        }
    }
}
