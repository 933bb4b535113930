//! Session context supplied with the first run of a session.

use std::{collections::HashMap, path::PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::traits::SessionId;

/// Where and by which agent a session's runs execute.
///
/// The coordinator never interprets these fields; runners and dashboards do.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionContext {
    /// Agent identifier (which executor backend a runner should use).
    pub agent: String,

    /// Working-directory hint for the runner.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// Session this one was forked from.
    #[serde(default)]
    pub parent_session_id: Option<SessionId>,

    /// Arbitrary metadata for app-specific needs.
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl SessionContext {
    /// Create a context with just an agent identifier.
    #[must_use]
    pub fn new(agent: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            ..Self::default()
        }
    }

    /// Set the working-directory hint.
    #[must_use]
    pub fn with_working_dir(mut self, working_dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(working_dir.into());
        self
    }
}
