//! Agent definition registry (C6).
//!
//! Scans a directory of `<name>.<ext>` files, each beginning with a
//! `---`-delimited YAML front-matter block naming at least `name` and
//! `description`, followed by a body appended verbatim to agent prompts.
//! Malformed files are logged and skipped rather than failing the whole
//! load, matching `original_source/app/orchestration/agent_adapter.py`'s
//! `_load_agents_registry`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::error::AgentRegistryError;

const FRONT_MATTER_DELIMITER: &str = "---";

/// A loaded agent: its identity, description, and prompt body.
#[derive(Debug, Clone)]
pub struct AgentDefinition {
    /// Agent name, from front matter.
    pub name: String,
    /// Human-readable description, from front matter.
    pub description: String,
    /// Prompt body appended after the front matter block.
    pub body: String,
    /// Path the definition was loaded from.
    pub source_path: PathBuf,
    /// Front-matter keys other than `name`/`description`, preserved rather
    /// than discarded (spec.md §6: "additional unrecognized keys are
    /// preserved"; this names the field the distillation left unnamed).
    pub extra: HashMap<String, Value>,
}

#[derive(Debug, Deserialize)]
struct FrontMatter {
    name: String,
    description: String,
    #[serde(flatten)]
    extra: HashMap<String, Value>,
}

fn parse_agent_file(path: &Path, raw: &str) -> Option<AgentDefinition> {
    let trimmed = raw.strip_prefix(FRONT_MATTER_DELIMITER)?;
    let trimmed = trimmed.strip_prefix('\n').unwrap_or(trimmed);
    let end = trimmed.find("\n---\n").or_else(|| {
        // allow a front-matter block that runs to end of file with a
        // trailing delimiter but no body
        trimmed.strip_suffix("\n---").map(|_| trimmed.len() - 4)
    })?;

    let (front_matter_raw, rest) = trimmed.split_at(end);
    let body = rest.strip_prefix("\n---\n").unwrap_or(rest).to_string();

    let front_matter: FrontMatter = match serde_yaml::from_str(front_matter_raw) {
        Ok(fm) => fm,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "skipping agent file with invalid front matter");
            return None;
        }
    };

    Some(AgentDefinition {
        name: front_matter.name,
        description: front_matter.description,
        body,
        source_path: path.to_path_buf(),
        extra: front_matter.extra,
    })
}

/// In-memory map of agent name to its loaded definition. Read-only once
/// built; rebuilding requires a fresh [`AgentRegistry`].
pub struct AgentRegistry {
    agents: HashMap<String, AgentDefinition>,
}

impl AgentRegistry {
    /// Scans `dir` for agent definition files, skipping malformed ones.
    pub fn load_from_dir(dir: impl AsRef<Path>) -> Result<Self, AgentRegistryError> {
        let dir = dir.as_ref();
        let mut agents = HashMap::new();

        let entries = std::fs::read_dir(dir).map_err(|e| AgentRegistryError::DirectoryUnreadable {
            path: dir.display().to_string(),
            source: e,
        })?;

        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let stem = match path.file_stem().and_then(|s| s.to_str()) {
                Some(s) => s.to_string(),
                None => continue,
            };

            let raw = match std::fs::read_to_string(&path) {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to read agent file");
                    continue;
                }
            };

            match parse_agent_file(&path, &raw) {
                Some(definition) => {
                    agents.insert(stem, definition);
                }
                None => {
                    warn!(path = %path.display(), "skipping malformed agent file");
                }
            }
        }

        Ok(Self { agents })
    }

    /// Builds a registry directly from in-memory definitions (tests, or
    /// embedding callers that don't load from disk).
    pub fn from_definitions(agents: HashMap<String, AgentDefinition>) -> Self {
        Self { agents }
    }

    /// Looks up an agent by name.
    pub fn get(&self, name: &str) -> Option<&AgentDefinition> {
        self.agents.get(name)
    }

    /// Number of loaded agents.
    pub fn len(&self) -> usize {
        self.agents.len()
    }

    /// Whether no agents were loaded.
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Lists `{name, description}` pairs for all loaded agents.
    pub fn available(&self) -> Vec<(String, String)> {
        self.agents
            .values()
            .map(|a| (a.name.clone(), a.description.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_agent_file(dir: &Path, filename: &str, content: &str) {
        let path = dir.join(filename);
        let mut file = std::fs::File::create(path).unwrap();
        write!(file, "{content}").unwrap();
    }

    #[test]
    fn loads_well_formed_agent() {
        let dir = TempDir::new().unwrap();
        write_agent_file(
            dir.path(),
            "developer.md",
            "---\nname: developer\ndescription: writes code\ncustom_field: 42\n---\nYou write code.\n",
        );

        let registry = AgentRegistry::load_from_dir(dir.path()).unwrap();
        assert_eq!(registry.len(), 1);
        let agent = registry.get("developer").unwrap();
        assert_eq!(agent.name, "developer");
        assert_eq!(agent.description, "writes code");
        assert!(agent.body.contains("You write code."));
        assert_eq!(agent.extra.get("custom_field").unwrap().as_i64(), Some(42));
    }

    #[test]
    fn skips_malformed_front_matter() {
        let dir = TempDir::new().unwrap();
        write_agent_file(dir.path(), "broken.md", "not front matter at all");
        write_agent_file(
            dir.path(),
            "ok.md",
            "---\nname: ok\ndescription: fine\n---\nbody\n",
        );

        let registry = AgentRegistry::load_from_dir(dir.path()).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.get("ok").is_some());
        assert!(registry.get("broken").is_none());
    }

    #[test]
    fn missing_directory_is_an_error() {
        let result = AgentRegistry::load_from_dir("/no/such/directory/exists");
        assert!(result.is_err());
    }
}
