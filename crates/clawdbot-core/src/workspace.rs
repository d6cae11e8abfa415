//! Agent workspace — the directory the agent reads its operating context
//! from. Bootstrap files are materialized on first touch; daily memory
//! notes live under `memory/`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clawdbot_provider::ContextFile;

/// Bootstrap files checked for first-run detection (in workspace order).
pub const BOOTSTRAP_FILES: [&str; 6] = [
    "AGENTS.md",
    "IDENTITY.md",
    "USER.md",
    "SOUL.md",
    "TOOLS.md",
    "HEARTBEAT.md",
];

#[derive(Debug, Clone)]
pub struct AgentWorkspace {
    root: PathBuf,
}

#[derive(Debug, Default)]
pub struct BootstrapReport {
    pub created: Vec<String>,
    /// True when none of the bootstrap files existed before this call.
    pub brand_new: bool,
}

impl AgentWorkspace {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Resolve the workspace path: expand a leading `~`, fall back to
    /// `$HOME/clawd` (or `$HOME/clawd-<profile>`).
    pub fn resolve(configured: Option<&str>, profile: Option<&str>) -> Self {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        let root = match configured {
            Some(path) if path == "~" => PathBuf::from(&home),
            Some(path) => match path.strip_prefix("~/") {
                Some(rest) => Path::new(&home).join(rest),
                None => PathBuf::from(path),
            },
            None => match profile {
                Some(profile) => Path::new(&home).join(format!("clawd-{profile}")),
                None => Path::new(&home).join("clawd"),
            },
        };
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn memory_dir(&self) -> PathBuf {
        self.root.join("memory")
    }

    pub fn skills_dir(&self) -> PathBuf {
        self.root.join("skills")
    }

    /// Ensure the workspace exists and materialize missing bootstrap
    /// files. `BOOTSTRAP.md` is written exactly once, when the workspace
    /// is brand new.
    pub fn ensure_bootstrap(&self) -> Result<BootstrapReport> {
        std::fs::create_dir_all(&self.root)
            .with_context(|| format!("creating workspace {}", self.root.display()))?;
        std::fs::create_dir_all(self.memory_dir())?;

        let mut report = BootstrapReport {
            brand_new: !BOOTSTRAP_FILES
                .iter()
                .any(|name| self.root.join(name).exists()),
            ..Default::default()
        };

        for name in BOOTSTRAP_FILES {
            let path = self.root.join(name);
            if !path.exists() {
                std::fs::write(&path, default_content(name))
                    .with_context(|| format!("writing {}", path.display()))?;
                report.created.push(name.to_string());
            }
        }

        if report.brand_new {
            let path = self.root.join("BOOTSTRAP.md");
            if !path.exists() {
                std::fs::write(&path, default_content("BOOTSTRAP.md"))?;
                report.created.push("BOOTSTRAP.md".to_string());
            }
        }

        Ok(report)
    }

    /// Load the bootstrap files that exist into context files.
    pub fn load_context_files(&self) -> Vec<ContextFile> {
        let mut files = Vec::new();
        for name in BOOTSTRAP_FILES {
            let path = self.root.join(name);
            if let Ok(content) = std::fs::read_to_string(&path) {
                if !content.trim().is_empty() {
                    files.push(ContextFile {
                        name: name.to_string(),
                        content,
                    });
                }
            }
        }
        files
    }

    pub fn daily_memory_path(&self, date: NaiveDate) -> PathBuf {
        self.memory_dir().join(format!("{}.md", date.format("%Y-%m-%d")))
    }

    /// Combined "Daily Memory" context from today's and yesterday's notes;
    /// None when both are empty or absent. The local date is injected for
    /// testability.
    pub fn load_daily_memory(&self, today: NaiveDate) -> Option<ContextFile> {
        let yesterday = today.pred_opt()?;
        let mut sections = Vec::new();
        for date in [yesterday, today] {
            let path = self.daily_memory_path(date);
            if let Ok(content) = std::fs::read_to_string(&path) {
                if !content.trim().is_empty() {
                    sections.push(format!("## {}\n{}", date.format("%Y-%m-%d"), content.trim()));
                }
            }
        }
        if sections.is_empty() {
            return None;
        }
        Some(ContextFile {
            name: "Daily Memory".to_string(),
            content: sections.join("\n\n"),
        })
    }
}

fn default_content(name: &str) -> String {
    match name {
        "AGENTS.md" => "# AGENTS.md\n\nOperating notes for this agent. Edit freely.\n",
        "IDENTITY.md" => "# IDENTITY.md\n\nWho this agent is. Name, role, voice.\n",
        "USER.md" => "# USER.md\n\nNotes about the person this agent works for.\n",
        "SOUL.md" => "# SOUL.md\n\nValues and boundaries. Keep it short.\n",
        "TOOLS.md" => "# TOOLS.md\n\nLocal tool notes: hosts, paths, credentials locations.\n",
        "HEARTBEAT.md" => "# HEARTBEAT.md\n\nTasks to check on each heartbeat. Empty means idle.\n",
        "BOOTSTRAP.md" => {
            "# BOOTSTRAP.md\n\nFirst run. Introduce yourself to the user, then fill in \
             IDENTITY.md and USER.md from the conversation.\n"
        }
        _ => "",
    }
    .to_string()
}
