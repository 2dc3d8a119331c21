//! Start options handed to a driver when its backend is launched.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Options for a single driver `start()`.
///
/// Every backend understands a working directory; resume handles and model
/// names are passed through verbatim and interpreted by the driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartOptions {
    /// Working directory for the agent process.
    pub cwd: PathBuf,

    /// Backend-native session handle to resume, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_session_id: Option<String>,

    /// Model override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl StartOptions {
    /// Create options for a fresh session in `cwd`.
    #[must_use]
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: cwd.into(),
            resume_session_id: None,
            model: None,
        }
    }

    /// Resume an existing backend session.
    #[must_use]
    pub fn resume(mut self, session_id: impl Into<String>) -> Self {
        self.resume_session_id = Some(session_id.into());
        self
    }

    /// Select a model.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Working directory as a path.
    #[must_use]
    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// Final path component of the working directory.
    #[must_use]
    pub fn project_name(&self) -> Option<String> {
        project_name_for(&self.cwd)
    }
}

/// Derive a display project name from a directory.
#[must_use]
pub fn project_name_for(cwd: &Path) -> Option<String> {
    cwd.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .filter(|name| !name.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_name_is_last_component() {
        let opts = StartOptions::new("/home/dev/projects/widget");
        assert_eq!(opts.project_name().as_deref(), Some("widget"));
        assert_eq!(project_name_for(Path::new("/")), None);
    }

    #[test]
    fn builder_sets_resume_and_model() {
        let opts = StartOptions::new("/tmp").resume("abc").with_model("sonnet");
        assert_eq!(opts.resume_session_id.as_deref(), Some("abc"));
        assert_eq!(opts.model.as_deref(), Some("sonnet"));
    }
}
