// ABOUTME: Language table mapping language names and aliases to interpreter invocations
// ABOUTME: Built-in table is embedded from config/languages.json and can be replaced per deployment

use crate::error::{Result, SandboxError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageSpec {
    pub name: String,
    pub extension: String,
    /// Interpreter argv; the code file path is appended at exec time
    pub command: Vec<String>,
    /// Where the code is written inside the sandbox
    pub file_path: String,
    #[serde(default)]
    pub aliases: Vec<String>,
}

impl LanguageSpec {
    pub fn invocation(&self) -> Vec<String> {
        let mut argv = self.command.clone();
        argv.push(self.file_path.clone());
        argv
    }
}

#[derive(Debug, Deserialize)]
struct LanguagesFile {
    #[allow(dead_code)]
    version: Option<String>,
    languages: Vec<LanguageSpec>,
}

#[derive(Debug, Clone)]
pub struct LanguageConfig {
    languages: HashMap<String, LanguageSpec>,
    /// Lowercased alias -> canonical name
    aliases: HashMap<String, String>,
}

impl LanguageConfig {
    /// The built-in language table
    pub fn builtin() -> Result<Self> {
        Self::from_json(include_str!("../config/languages.json"))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let file: LanguagesFile = serde_json::from_str(json)
            .map_err(|e| SandboxError::Config(format!("Invalid language table: {}", e)))?;

        let mut languages = HashMap::new();
        for spec in file.languages {
            if spec.command.is_empty() {
                return Err(SandboxError::Config(format!(
                    "Language '{}' has an empty command",
                    spec.name
                )));
            }
            if !spec.file_path.starts_with('/') {
                return Err(SandboxError::Config(format!(
                    "Language '{}' file_path must be absolute",
                    spec.name
                )));
            }
            let key = spec.name.to_lowercase();
            if languages.insert(key, spec.clone()).is_some() {
                return Err(SandboxError::Config(format!(
                    "Language '{}' is defined twice",
                    spec.name
                )));
            }
        }

        let mut aliases: HashMap<String, String> = HashMap::new();
        for spec in languages.values() {
            for alias in &spec.aliases {
                let lowered = alias.to_lowercase();
                if languages.contains_key(&lowered) && lowered != spec.name.to_lowercase() {
                    return Err(SandboxError::Config(format!(
                        "Alias '{}' of language '{}' shadows another language name",
                        alias, spec.name
                    )));
                }
                if let Some(owner) = aliases.insert(lowered, spec.name.to_lowercase()) {
                    return Err(SandboxError::Config(format!(
                        "Alias '{}' is claimed by both '{}' and '{}'",
                        alias, owner, spec.name
                    )));
                }
            }
        }

        Ok(Self { languages, aliases })
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = tokio::fs::read_to_string(path).await.map_err(|e| {
            SandboxError::Config(format!(
                "Failed to read language table {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_json(&json)
    }

    /// Look up by canonical name first, then alias, case-insensitively
    pub fn get(&self, name: &str) -> Option<&LanguageSpec> {
        let lowered = name.trim().to_lowercase();
        self.languages.get(&lowered).or_else(|| {
            self.aliases
                .get(&lowered)
                .and_then(|canonical| self.languages.get(canonical))
        })
    }

    /// Like `get`, failing with `UnsupportedLanguage`
    pub fn resolve(&self, name: &str) -> Result<&LanguageSpec> {
        self.get(name)
            .ok_or_else(|| SandboxError::UnsupportedLanguage(name.to_string()))
    }

    pub fn is_supported(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Canonical names, sorted
    pub fn list_supported(&self) -> Vec<String> {
        let mut names: Vec<String> = self.languages.values().map(|l| l.name.clone()).collect();
        names.sort();
        names
    }

    pub fn specs(&self) -> Vec<&LanguageSpec> {
        let mut specs: Vec<&LanguageSpec> = self.languages.values().collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }
}
