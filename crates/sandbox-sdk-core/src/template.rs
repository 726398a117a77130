//! Environment templates and remote path helpers.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Template command error.
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("Run command cannot be parsed: {0}")]
    InvalidCommand(String),
    #[error("Run command is empty after parsing")]
    EmptyCommand,
    #[error("Failed to quote command: {0}")]
    Quote(#[from] shlex::QuoteError),
}

/// Describes how code is laid out and run inside one kind of environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    /// Template identifier sent with the environment start message.
    pub id: String,
    /// Extension given to code files, including the dot.
    pub file_extension: String,
    /// Directory the environment's project lives under.
    pub root_dir: String,
    /// Program that runs a code file, e.g. `python3`. `None` disables code execution.
    #[serde(default)]
    pub run_command: Option<String>,
}

impl Template {
    /// Template without a run command.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        file_extension: impl Into<String>,
        root_dir: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            file_extension: file_extension.into(),
            root_dir: root_dir.into(),
            run_command: None,
        }
    }

    /// Set the program used to run code files.
    #[must_use]
    pub fn with_run_command(mut self, program: impl Into<String>) -> Self {
        self.run_command = Some(program.into());
        self
    }

    /// Built-in template by id (`nodejs`, `python3`, `bash`).
    #[must_use]
    pub fn builtin(id: &str) -> Option<Self> {
        let (ext, program) = match id {
            "nodejs" => (".js", "node"),
            "python3" => (".py", "python3"),
            "bash" => (".sh", "bash"),
            _ => return None,
        };
        Some(Self::new(id, ext, "/code").with_run_command(program))
    }

    /// Shell command that runs the file at `path`, if this template can run code.
    ///
    /// # Errors
    /// Returns error if the run command cannot be split or the result cannot be quoted.
    pub fn to_command(&self, path: &str) -> Result<Option<String>, TemplateError> {
        let Some(program) = &self.run_command else {
            return Ok(None);
        };
        let mut parts =
            shlex::split(program).ok_or_else(|| TemplateError::InvalidCommand(program.clone()))?;
        if parts.is_empty() {
            return Err(TemplateError::EmptyCommand);
        }
        parts.push(path.to_string());
        Ok(Some(shlex::try_join(parts.iter().map(String::as_str))?))
    }
}

/// Join a remote path onto a base directory.
#[must_use]
pub fn join_remote(base: &str, path: &str) -> String {
    if base.is_empty() {
        return path.to_string();
    }
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Split a remote path into `(parent directory, base name)`.
#[must_use]
pub fn split_remote(path: &str) -> (&str, &str) {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return if path.is_empty() { (".", "") } else { ("/", "") };
    }
    match trimmed.rfind('/') {
        None => (".", trimmed),
        Some(0) => ("/", &trimmed[1..]),
        Some(i) => (&trimmed[..i], &trimmed[i + 1..]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_python_command() {
        let template = Template::builtin("python3").unwrap();
        assert_eq!(template.file_extension, ".py");
        let cmd = template.to_command("/code/src/abc.py").unwrap();
        assert_eq!(cmd.as_deref(), Some("python3 /code/src/abc.py"));
    }

    #[test]
    fn test_command_quotes_path() {
        let template = Template::new("custom", ".rb", "/app").with_run_command("ruby -w");
        let cmd = template.to_command("/app/my file.rb").unwrap().unwrap();
        assert_eq!(cmd, "ruby -w '/app/my file.rb'");
    }

    #[test]
    fn test_no_run_command() {
        let template = Template::new("static", ".txt", "/");
        assert!(template.to_command("/a.txt").unwrap().is_none());
    }

    #[test]
    fn test_empty_run_command_rejected() {
        let template = Template::new("broken", ".x", "/").with_run_command("   ");
        assert!(matches!(
            template.to_command("/a.x"),
            Err(TemplateError::EmptyCommand)
        ));
    }

    #[test]
    fn test_join_remote() {
        assert_eq!(join_remote("/code", "/src/abc.py"), "/code/src/abc.py");
        assert_eq!(join_remote("/code/", "src/abc.py"), "/code/src/abc.py");
        assert_eq!(join_remote("/", "/src/abc.py"), "/src/abc.py");
    }

    #[test]
    fn test_split_remote() {
        assert_eq!(split_remote("/a/b.txt"), ("/a", "b.txt"));
        assert_eq!(split_remote("/a"), ("/", "a"));
        assert_eq!(split_remote("/a/dir/"), ("/a", "dir"));
        assert_eq!(split_remote("name"), (".", "name"));
    }
}
