//! Command-line parsing for the `qadapt` shell.

use anyhow::{bail, Result};

pub const USAGE: &str = "\
Usage: qadapt <command> [args]

Session:
  login [username]        Log in (prompts for password)
  signup                  Create an account and log in
  logout                  End the session
  whoami                  Show the logged-in user
  status                  Show session state without contacting the server
  retry                   Reconnect after a connection failure

API:
  get <path>              GET an API path and print the JSON response
  delete <path>           DELETE an API path
  post <path> <json>      POST a JSON body
  put <path> <json>       PUT a JSON body

Environment:
  QADAPT_API_BASE_URL     API base URL
  QADAPT_SESSION_STORE    file | keyring | memory
  QADAPT_LOG_FILE=1       Also log to a daily file in the cache directory
  RUST_LOG                Log filter (default: warn)";

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Login { username: Option<String> },
    Signup,
    Logout,
    Whoami,
    Status,
    Retry,
    Get { path: String },
    Delete { path: String },
    Post { path: String, body: serde_json::Value },
    Put { path: String, body: serde_json::Value },
    Help,
}

impl Command {
    /// Parse arguments, excluding the program name
    pub fn parse(args: &[String]) -> Result<Self> {
        let mut args = args.iter().map(String::as_str);
        let Some(name) = args.next() else {
            return Ok(Command::Help);
        };

        let command = match name {
            "login" => Command::Login {
                username: args.next().map(str::to_string),
            },
            "signup" | "register" => Command::Signup,
            "logout" => Command::Logout,
            "whoami" | "me" => Command::Whoami,
            "status" => Command::Status,
            "retry" => Command::Retry,
            "get" => Command::Get {
                path: required(args.next(), "path")?,
            },
            "delete" => Command::Delete {
                path: required(args.next(), "path")?,
            },
            "post" | "put" => {
                let path = required(args.next(), "path")?;
                let raw = required(args.next(), "json body")?;
                let body = serde_json::from_str(&raw)
                    .map_err(|e| anyhow::anyhow!("Invalid JSON body: {}", e))?;
                if name == "post" {
                    Command::Post { path, body }
                } else {
                    Command::Put { path, body }
                }
            }
            "help" | "--help" | "-h" => Command::Help,
            other => bail!("Unknown command: {}\n\n{}", other, USAGE),
        };

        if let Some(extra) = args.next() {
            bail!("Unexpected argument: {}", extra);
        }
        Ok(command)
    }
}

fn required(arg: Option<&str>, what: &str) -> Result<String> {
    match arg {
        Some(value) if !value.trim().is_empty() => Ok(value.to_string()),
        _ => bail!("Missing {}\n\n{}", what, USAGE),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Command> {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        Command::parse(&args)
    }

    #[test]
    fn test_parse_session_commands() {
        assert_eq!(parse(&[]).unwrap(), Command::Help);
        assert_eq!(parse(&["login"]).unwrap(), Command::Login { username: None });
        assert_eq!(
            parse(&["login", "alice"]).unwrap(),
            Command::Login {
                username: Some("alice".to_string())
            }
        );
        assert_eq!(parse(&["register"]).unwrap(), Command::Signup);
        assert_eq!(parse(&["me"]).unwrap(), Command::Whoami);
        assert_eq!(parse(&["retry"]).unwrap(), Command::Retry);
    }

    #[test]
    fn test_parse_api_commands() {
        assert_eq!(
            parse(&["get", "api/collections"]).unwrap(),
            Command::Get {
                path: "api/collections".to_string()
            }
        );
        assert_eq!(
            parse(&["post", "api/collections", r#"{"name":"smoke"}"#]).unwrap(),
            Command::Post {
                path: "api/collections".to_string(),
                body: serde_json::json!({"name": "smoke"})
            }
        );
        assert!(matches!(
            parse(&["put", "api/scripts/3", "[1,2]"]).unwrap(),
            Command::Put { .. }
        ));
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse(&["get"]).is_err());
        assert!(parse(&["post", "api/collections"]).is_err());
        assert!(parse(&["post", "api/collections", "{not json"]).is_err());
        assert!(parse(&["logout", "now"]).is_err());
        assert!(parse(&["frobnicate"]).is_err());
    }
}
