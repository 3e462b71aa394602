//! Loads a textual agent persona to prepend to model prompts.

use std::path::Path;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("failed to read identity file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

const DEFAULT_PERSONA: &str = "You are a helpful personal assistant.";

/// A loaded agent persona. Cheap to clone; the prompt-assembly step in the
/// agent reads `text()` once per reasoning step.
#[derive(Debug, Clone)]
pub struct Identity {
    text: String,
}

impl Identity {
    pub fn from_text(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    /// Reads a persona file from disk. Callers that have no file configured
    /// should use [`Identity::default`] instead of calling this.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, IdentityError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| IdentityError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self { text })
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}

impl Default for Identity {
    fn default() -> Self {
        Self::from_text(DEFAULT_PERSONA)
    }
}
