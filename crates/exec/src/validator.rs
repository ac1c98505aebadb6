//! Command injection validation
//!
//! Processes are always spawned without a shell: the program path and each
//! argument reach the OS as discrete tokens. That makes a character allow-list
//! sufficient. Anything a shell would interpret is refused outright, so the
//! validator stays meaningful even if a caller later wraps the command in one.
//!
//! Backslash and forward slash are allowed on purpose; both are needed for
//! Windows and Unix paths.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Characters a shell would treat specially
pub const SHELL_METACHARACTERS: &[char] = &[
    ';', '&', '|', '`', '$', '(', ')', '{', '}', '[', ']', '<', '>', '!', '*', '?', '#', '~',
    '\n', '\r',
];

/// Where in the invocation a rejected token was found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "index")]
pub enum TokenLocation {
    Command,
    Argument(usize),
}

impl fmt::Display for TokenLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Command => write!(f, "command"),
            Self::Argument(i) => write!(f, "argument {i}"),
        }
    }
}

/// Why an invocation was refused
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("command is empty")]
    EmptyCommand,

    #[error("{location} contains shell metacharacter {character:?}")]
    Metacharacter {
        location: TokenLocation,
        character: char,
    },

    #[error("argument {index} contains chaining or redirection operator {operator:?}")]
    ChainingOperator { index: usize, operator: String },

    #[error("command path contains '..'")]
    PathTraversal,
}

fn chaining_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        // `||` `&&` `>>` `<<` anywhere, or an argument that starts as a redirection.
        Regex::new(r"\|\||&&|>>|<<|^\s*[<>]&?").expect("chaining pattern is a valid regex")
    })
}

fn find_metacharacter(token: &str) -> Option<char> {
    token.chars().find(|c| SHELL_METACHARACTERS.contains(c))
}

/// Check a command and its arguments before they reach process creation.
///
/// Path traversal is only checked on the command itself. Arguments may be
/// legitimate relative paths such as `../scenes/main.tscn`.
pub fn validate(command: &str, args: &[String]) -> Result<(), ValidationError> {
    if command.trim().is_empty() {
        return Err(ValidationError::EmptyCommand);
    }

    if let Some(character) = find_metacharacter(command) {
        return Err(ValidationError::Metacharacter {
            location: TokenLocation::Command,
            character,
        });
    }

    if command.contains("..") {
        return Err(ValidationError::PathTraversal);
    }

    for (index, arg) in args.iter().enumerate() {
        if let Some(m) = chaining_pattern().find(arg) {
            return Err(ValidationError::ChainingOperator {
                index,
                operator: m.as_str().trim().to_string(),
            });
        }

        if let Some(character) = find_metacharacter(arg) {
            return Err(ValidationError::Metacharacter {
                location: TokenLocation::Argument(index),
                character,
            });
        }
    }

    Ok(())
}
