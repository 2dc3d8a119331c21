//! Backend command lines.

use std::path::PathBuf;

use thiserror::Error;

use crate::resolve::resolve_executable_path;

/// Command build error.
#[derive(Debug, Error)]
pub enum CommandBuildError {
    #[error("Base command cannot be parsed: {0}")]
    InvalidBase(String),
    #[error("Base command is empty after parsing")]
    EmptyCommand,
    #[error("Executable not found: {0}")]
    NotFound(String),
}

/// Parsed command parts (program + args).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandParts {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandParts {
    /// Resolve the program to an absolute path.
    ///
    /// # Errors
    /// Returns error if the executable is not found.
    pub async fn into_resolved(self) -> Result<(PathBuf, Vec<String>), CommandBuildError> {
        let Self { program, args } = self;
        let executable = resolve_executable_path(&program)
            .await
            .ok_or(CommandBuildError::NotFound(program))?;
        Ok((executable, args))
    }
}

/// Builds a backend invocation from a configured base command.
///
/// The base may carry its own arguments (`"codex app-server"`); configured
/// params follow it and per-start arguments come last.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    base: String,
    params: Vec<String>,
}

impl CommandBuilder {
    #[must_use]
    pub fn new<S: Into<String>>(base: S) -> Self {
        Self {
            base: base.into(),
            params: Vec::new(),
        }
    }

    /// Append parameters.
    #[must_use]
    pub fn extend_params<I>(mut self, more: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.params.extend(more.into_iter().map(Into::into));
        self
    }

    /// Build the invocation with `extra` appended.
    ///
    /// # Errors
    /// Returns error if the base command cannot be split or is empty.
    pub fn build(&self, extra: &[String]) -> Result<CommandParts, CommandBuildError> {
        let mut parts = split_command_line(&self.base)?;
        parts.extend(self.params.iter().cloned());
        parts.extend(extra.iter().cloned());

        if parts.is_empty() {
            return Err(CommandBuildError::EmptyCommand);
        }
        let program = parts.remove(0);
        Ok(CommandParts {
            program,
            args: parts,
        })
    }
}

fn split_command_line(input: &str) -> Result<Vec<String>, CommandBuildError> {
    #[cfg(windows)]
    {
        Ok(winsplit::split(input))
    }

    #[cfg(not(windows))]
    {
        shlex::split(input).ok_or_else(|| CommandBuildError::InvalidBase(input.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_arguments_precede_params_and_extras() {
        let parts = CommandBuilder::new("codex app-server")
            .extend_params(["-c", "model=\"o3\""])
            .build(&["--verbose".to_string()])
            .unwrap();
        assert_eq!(parts.program, "codex");
        assert_eq!(
            parts.args,
            vec!["app-server", "-c", "model=\"o3\"", "--verbose"]
        );
    }

    #[cfg(not(windows))]
    #[test]
    fn quoted_base_is_split_like_a_shell() {
        let parts = CommandBuilder::new("'/opt/my tools/gemini' --experimental-acp")
            .build(&[])
            .unwrap();
        assert_eq!(parts.program, "/opt/my tools/gemini");
        assert_eq!(parts.args, vec!["--experimental-acp"]);
    }

    #[test]
    fn empty_base_is_rejected() {
        assert!(matches!(
            CommandBuilder::new("   ").build(&[]),
            Err(CommandBuildError::EmptyCommand)
        ));
    }

    #[cfg(not(windows))]
    #[test]
    fn unbalanced_quotes_are_rejected() {
        assert!(matches!(
            CommandBuilder::new("claude 'oops").build(&[]),
            Err(CommandBuildError::InvalidBase(_))
        ));
    }
}
