//! Filesystem skills: capability descriptors contributing prompt
//! fragments and env bindings.
//!
//! Skills are `SKILL.md` files with YAML frontmatter. Discovery unions
//! several directories (bundled, configured extras, managed, workspace);
//! later sources override earlier ones by name.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::config::{SkillEntry, SkillsSection};
use crate::env_guard::EnvOverride;

#[derive(Debug, Clone, Deserialize)]
pub struct SkillFrontmatter {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub clawd: ClawdMeta,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClawdMeta {
    /// Always include regardless of requirements.
    #[serde(default)]
    pub always: bool,
    /// Config key when it differs from the skill name.
    #[serde(default)]
    pub skill_key: Option<String>,
    /// Env var an `apiKey` config entry binds to.
    #[serde(default)]
    pub primary_env: Option<String>,
    #[serde(default)]
    pub requires: SkillRequirements,
    /// Platform gate (`linux`, `macos`, `windows`).
    #[serde(default)]
    pub os: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SkillRequirements {
    #[serde(default)]
    pub bins: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Skill {
    pub name: String,
    pub description: String,
    pub meta: ClawdMeta,
    pub content: String,
    pub path: PathBuf,
}

impl Skill {
    pub fn config_key(&self) -> &str {
        self.meta.skill_key.as_deref().unwrap_or(&self.name)
    }
}

fn parse_frontmatter(raw: &str) -> Result<(SkillFrontmatter, String)> {
    let trimmed = raw.trim_start();
    if !trimmed.starts_with("---") {
        anyhow::bail!("SKILL.md must start with YAML frontmatter (---)");
    }
    let after_first = &trimmed[3..];
    let end = after_first
        .find("---")
        .ok_or_else(|| anyhow::anyhow!("no closing --- for frontmatter"))?;
    let yaml_str = &after_first[..end];
    let content = after_first[end + 3..].trim().to_string();
    let fm: SkillFrontmatter =
        serde_yaml::from_str(yaml_str).context("parsing skill frontmatter YAML")?;
    Ok((fm, content))
}

fn load_skill(path: &Path) -> Result<Skill> {
    let raw =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let (fm, content) = parse_frontmatter(&raw)?;
    Ok(Skill {
        name: fm.name,
        description: fm.description,
        meta: fm.clawd,
        content,
        path: path.to_path_buf(),
    })
}

fn bin_on_path(name: &str) -> bool {
    let Some(paths) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&paths).any(|dir| dir.join(name).is_file())
}

#[derive(Debug, Clone, Default)]
pub struct SkillRegistry {
    skills: HashMap<String, Skill>,
}

impl SkillRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Discover skills across `dirs` in order; a later skill with the same
    /// name replaces an earlier one.
    pub fn discover(dirs: &[PathBuf]) -> Self {
        let mut registry = Self::new();
        for dir in dirs {
            if !dir.exists() {
                continue;
            }
            let entries = match std::fs::read_dir(dir) {
                Ok(entries) => entries,
                Err(err) => {
                    tracing::warn!("skipping skill dir {}: {err}", dir.display());
                    continue;
                }
            };
            for entry in entries.filter_map(|e| e.ok()) {
                let skill_md = entry.path().join("SKILL.md");
                if !skill_md.is_file() {
                    continue;
                }
                match load_skill(&skill_md) {
                    Ok(skill) => {
                        registry.skills.insert(skill.name.clone(), skill);
                    }
                    Err(err) => {
                        tracing::warn!("failed to load {}: {err}", skill_md.display());
                    }
                }
            }
        }
        registry
    }

    pub fn get(&self, name: &str) -> Option<&Skill> {
        self.skills.get(name)
    }

    pub fn list(&self) -> Vec<&Skill> {
        let mut skills: Vec<_> = self.skills.values().collect();
        skills.sort_by(|a, b| a.name.cmp(&b.name));
        skills
    }

    /// Skills eligible for this run: not disabled by config, platform
    /// matches, and either `always` or all requirements are satisfiable
    /// (bins on PATH; env vars present or provided via skill config).
    pub fn eligible(&self, config: &SkillsSection) -> Vec<&Skill> {
        let mut out: Vec<_> = self
            .skills
            .values()
            .filter(|skill| skill_eligible(skill, config.entries.get(skill.config_key())))
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Env overrides the eligible skills contribute: configured `env`
    /// entries push only-if-unset; an `apiKey` with a declared
    /// `primaryEnv` binds unconditionally.
    pub fn env_overrides(&self, config: &SkillsSection) -> Vec<EnvOverride> {
        let mut overrides = Vec::new();
        for skill in self.eligible(config) {
            let Some(entry) = config.entries.get(skill.config_key()) else {
                continue;
            };
            for (key, value) in &entry.env {
                overrides.push(EnvOverride::if_unset(key.clone(), value.clone()));
            }
            if let (Some(api_key), Some(primary_env)) =
                (&entry.api_key, &skill.meta.primary_env)
            {
                overrides.push(EnvOverride::always(primary_env.clone(), api_key.clone()));
            }
        }
        overrides
    }

    /// Prompt fragment enumerating the eligible skills.
    pub fn summary_prompt(&self, config: &SkillsSection) -> String {
        let eligible = self.eligible(config);
        if eligible.is_empty() {
            return String::new();
        }
        let mut lines = vec!["## Available Skills".to_string()];
        for skill in &eligible {
            lines.push(format!("- **{}**: {}", skill.name, skill.description));
        }
        lines.join("\n")
    }
}

fn skill_eligible(skill: &Skill, entry: Option<&SkillEntry>) -> bool {
    if entry.and_then(|e| e.enabled) == Some(false) {
        return false;
    }
    if let Some(os) = &skill.meta.os {
        if os != std::env::consts::OS {
            return false;
        }
    }
    if skill.meta.always {
        return true;
    }
    for bin in &skill.meta.requires.bins {
        if !bin_on_path(bin) {
            return false;
        }
    }
    for var in &skill.meta.requires.env {
        let in_process = std::env::var(var).is_ok();
        let in_config = entry.is_some_and(|e| {
            e.env.contains_key(var)
                || (e.api_key.is_some() && skill.meta.primary_env.as_deref() == Some(var))
        });
        if !in_process && !in_config {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_skill(dir: &Path, name: &str, frontmatter_extra: &str) {
        let skill_dir = dir.join(name);
        std::fs::create_dir_all(&skill_dir).unwrap();
        std::fs::write(
            skill_dir.join("SKILL.md"),
            format!("---\nname: {name}\ndescription: {name} skill\n{frontmatter_extra}---\nBody of {name}"),
        )
        .unwrap();
    }

    #[test]
    fn parse_frontmatter_extracts_clawd_meta() {
        let raw = "---\nname: search\ndescription: Web search\nclawd:\n  always: false\n  primaryEnv: SEARCH_API_KEY\n  requires:\n    env: [SEARCH_API_KEY]\n---\nUse the search tool.";
        let (fm, content) = parse_frontmatter(raw).unwrap();
        assert_eq!(fm.name, "search");
        assert_eq!(fm.clawd.primary_env.as_deref(), Some("SEARCH_API_KEY"));
        assert_eq!(fm.clawd.requires.env, vec!["SEARCH_API_KEY"]);
        assert!(content.contains("search tool"));
    }

    #[test]
    fn parse_frontmatter_rejects_missing() {
        assert!(parse_frontmatter("# no frontmatter").is_err());
    }

    #[test]
    fn later_dirs_override_by_name() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        write_skill(a.path(), "notes", "");
        let dir_b = b.path().join("notes");
        std::fs::create_dir_all(&dir_b).unwrap();
        std::fs::write(
            dir_b.join("SKILL.md"),
            "---\nname: notes\ndescription: overridden\n---\nNewer body",
        )
        .unwrap();

        let registry =
            SkillRegistry::discover(&[a.path().to_path_buf(), b.path().to_path_buf()]);
        assert_eq!(registry.list().len(), 1);
        assert_eq!(registry.get("notes").unwrap().description, "overridden");
    }

    #[test]
    fn disabled_via_config_is_excluded() {
        let tmp = tempfile::tempdir().unwrap();
        write_skill(tmp.path(), "notes", "");
        let registry = SkillRegistry::discover(&[tmp.path().to_path_buf()]);

        let mut section = SkillsSection::default();
        section.entries.insert(
            "notes".into(),
            SkillEntry {
                enabled: Some(false),
                ..Default::default()
            },
        );
        assert!(registry.eligible(&section).is_empty());
    }

    #[test]
    fn os_gate_excludes_other_platforms() {
        let tmp = tempfile::tempdir().unwrap();
        write_skill(tmp.path(), "mac-only", "clawd:\n  os: nonexistent-os\n");
        let registry = SkillRegistry::discover(&[tmp.path().to_path_buf()]);
        assert!(registry.eligible(&SkillsSection::default()).is_empty());
    }

    #[test]
    fn always_skill_skips_requirements() {
        let tmp = tempfile::tempdir().unwrap();
        write_skill(
            tmp.path(),
            "pinned",
            "clawd:\n  always: true\n  requires:\n    bins: [definitely-not-a-binary]\n",
        );
        let registry = SkillRegistry::discover(&[tmp.path().to_path_buf()]);
        assert_eq!(registry.eligible(&SkillsSection::default()).len(), 1);
    }

    #[test]
    fn missing_required_env_excludes_unless_configured() {
        let tmp = tempfile::tempdir().unwrap();
        write_skill(
            tmp.path(),
            "search",
            "clawd:\n  primaryEnv: CLAWDBOT_TEST_SEARCH_KEY\n  requires:\n    env: [CLAWDBOT_TEST_SEARCH_KEY]\n",
        );
        std::env::remove_var("CLAWDBOT_TEST_SEARCH_KEY");
        let registry = SkillRegistry::discover(&[tmp.path().to_path_buf()]);

        assert!(registry.eligible(&SkillsSection::default()).is_empty());

        // Satisfiable from config via apiKey + primaryEnv.
        let mut section = SkillsSection::default();
        section.entries.insert(
            "search".into(),
            SkillEntry {
                api_key: Some("secret".into()),
                ..Default::default()
            },
        );
        assert_eq!(registry.eligible(&section).len(), 1);
    }

    #[test]
    fn env_overrides_bind_api_key_to_primary_env() {
        let tmp = tempfile::tempdir().unwrap();
        write_skill(
            tmp.path(),
            "search",
            "clawd:\n  always: true\n  primaryEnv: CLAWDBOT_TEST_PRIMARY\n",
        );
        let registry = SkillRegistry::discover(&[tmp.path().to_path_buf()]);

        let mut section = SkillsSection::default();
        section.entries.insert(
            "search".into(),
            SkillEntry {
                api_key: Some("secret".into()),
                env: HashMap::from([("EXTRA".to_string(), "1".to_string())]),
                ..Default::default()
            },
        );

        let overrides = registry.env_overrides(&section);
        assert_eq!(overrides.len(), 2);
        let primary = overrides
            .iter()
            .find(|o| o.key == "CLAWDBOT_TEST_PRIMARY")
            .unwrap();
        assert!(primary.set_always);
        assert_eq!(primary.value, "secret");
        let extra = overrides.iter().find(|o| o.key == "EXTRA").unwrap();
        assert!(!extra.set_always);
    }

    #[test]
    fn skill_key_overrides_config_lookup() {
        let tmp = tempfile::tempdir().unwrap();
        write_skill(tmp.path(), "long-name", "clawd:\n  skillKey: short\n");
        let registry = SkillRegistry::discover(&[tmp.path().to_path_buf()]);

        let mut section = SkillsSection::default();
        section.entries.insert(
            "short".into(),
            SkillEntry {
                enabled: Some(false),
                ..Default::default()
            },
        );
        assert!(registry.eligible(&section).is_empty());
    }

    #[test]
    fn summary_prompt_lists_eligible() {
        let tmp = tempfile::tempdir().unwrap();
        write_skill(tmp.path(), "alpha", "");
        write_skill(tmp.path(), "beta", "");
        let registry = SkillRegistry::discover(&[tmp.path().to_path_buf()]);
        let prompt = registry.summary_prompt(&SkillsSection::default());
        assert!(prompt.contains("## Available Skills"));
        let alpha = prompt.find("**alpha**").unwrap();
        let beta = prompt.find("**beta**").unwrap();
        assert!(alpha < beta);
    }
}
