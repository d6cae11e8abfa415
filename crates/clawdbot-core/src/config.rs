//! Configuration tree (`clawdbot.json`, fallback `clawd.json`).
//!
//! Unknown fields are rejected everywhere except plugin entry configs,
//! which stay raw `serde_json::Value` for the plugin's own schema.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_MODEL: &str = "anthropic/claude-sonnet-4-20250514";
pub const DEFAULT_BRIDGE_PORT: u16 = 18_790;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct Config {
    pub agent: AgentSection,
    pub session: SessionSection,
    pub cron: CronSection,
    pub skills: SkillsSection,
    pub plugins: PluginsSection,
    pub tools: ToolsSection,
    pub bridge: BridgeSection,
    pub discovery: DiscoverySection,
    pub heartbeat: HeartbeatSection,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct AgentSection {
    pub workspace: Option<String>,
    pub model: ModelSection,
    pub thinking: Option<String>,
    pub bash: BashSection,
    pub tools: ToolFilter,
    /// Short name -> alias mapping; non-empty map also acts as the
    /// fallback allow-list.
    pub models: HashMap<String, ModelEntry>,
    pub response_prefix: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct ModelSection {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub fallbacks: Vec<String>,
}

impl ModelSection {
    /// Primary model as `provider/model`; the built-in default otherwise.
    pub fn primary(&self) -> String {
        match (&self.provider, &self.model) {
            (Some(provider), Some(model)) => format!("{provider}/{model}"),
            (None, Some(model)) if model.contains('/') => model.clone(),
            _ => DEFAULT_MODEL.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct BashSection {
    pub background_ms: u64,
    pub timeout_sec: u64,
}

impl Default for BashSection {
    fn default() -> Self {
        Self {
            background_ms: 10_000,
            timeout_sec: 120,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct ToolFilter {
    pub allow: Vec<String>,
    pub deny: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct ModelEntry {
    pub alias: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionScope {
    #[default]
    PerSender,
    Global,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct SessionSection {
    pub scope: SessionScope,
    pub main_key: Option<String>,
    pub store: Option<String>,
    pub idle_minutes: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct CronSection {
    pub enabled: bool,
    pub store: Option<String>,
    pub max_concurrent_runs: usize,
}

impl Default for CronSection {
    fn default() -> Self {
        Self {
            enabled: true,
            store: None,
            max_concurrent_runs: 4,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct SkillsSection {
    pub entries: HashMap<String, SkillEntry>,
    /// Extra skill directories searched after the bundled set.
    pub dirs: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct SkillEntry {
    pub enabled: Option<bool>,
    pub api_key: Option<String>,
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct PluginsSection {
    pub load: PluginLoad,
    pub allow: Vec<String>,
    pub deny: Vec<String>,
    pub entries: HashMap<String, PluginEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct PluginLoad {
    pub paths: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct PluginEntry {
    pub enabled: Option<bool>,
    /// Raw config handed to the plugin's own schema.
    pub config: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct ToolsSection {
    pub audio: AudioSection,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct AudioSection {
    pub transcription: Option<TranscriptionSection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TranscriptionSection {
    /// External command argv; `{{MediaPath}}` is substituted per call.
    pub args: Vec<String>,
    #[serde(default = "default_transcription_timeout")]
    pub timeout_seconds: u64,
}

fn default_transcription_timeout() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct BridgeSection {
    pub bind: String,
    pub port: u16,
    pub enabled: bool,
}

impl Default for BridgeSection {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: DEFAULT_BRIDGE_PORT,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct DiscoverySection {
    pub wide_area: WideAreaSection,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct WideAreaSection {
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct HeartbeatSection {
    /// `"30m"`, `"1h"`, `"60s"`.
    pub interval: String,
    pub prompt: Option<String>,
    pub ack_max_chars: usize,
}

impl Default for HeartbeatSection {
    fn default() -> Self {
        Self {
            interval: "30m".to_string(),
            prompt: None,
            ack_max_chars: 30,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Load from an explicit path, `$CLAWD_CONFIG_PATH`, or the first of
    /// `clawdbot.json` / `clawd.json` under the state dir; defaults when
    /// nothing exists.
    pub fn load_or_default(explicit: Option<&Path>, state_dir: &Path) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        if let Ok(path) = std::env::var("CLAWD_CONFIG_PATH") {
            return Self::load(Path::new(&path));
        }
        for name in ["clawdbot.json", "clawd.json"] {
            let path = state_dir.join(name);
            if path.exists() {
                return Self::load(&path);
            }
        }
        Ok(Self::default())
    }

    /// Bridge settings after `CLAWDBOT_BRIDGE_*` overrides.
    pub fn bridge_effective(&self) -> BridgeSection {
        let mut bridge = self.bridge.clone();
        if let Ok(host) = std::env::var("CLAWDBOT_BRIDGE_HOST") {
            bridge.bind = host;
        }
        if let Some(port) = std::env::var("CLAWDBOT_BRIDGE_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
        {
            bridge.port = port;
        }
        if std::env::var("CLAWDBOT_BRIDGE_ENABLED").as_deref() == Ok("0") {
            bridge.enabled = false;
        }
        bridge
    }

    pub fn cron_enabled(&self) -> bool {
        if std::env::var("CLAWD_SKIP_CRON").as_deref() == Ok("1") {
            return false;
        }
        self.cron.enabled
    }

    pub fn discovery_enabled(&self) -> bool {
        std::env::var("CLAWDBOT_DISABLE_BONJOUR").as_deref() != Ok("1")
    }
}

/// Explicit runtime context replacing module-level singletons; tests
/// inject their own state dir.
#[derive(Debug, Clone)]
pub struct Runtime {
    state_dir: PathBuf,
    profile: Option<String>,
}

impl Runtime {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            profile: None,
        }
    }

    pub fn with_profile(mut self, profile: Option<String>) -> Self {
        self.profile = profile;
        self
    }

    /// Build from `CLAWD_STATE_DIR` / `CLAWD_PROFILE`, defaulting to
    /// `$HOME/.clawdbot` (suffixed by profile).
    pub fn from_env() -> Self {
        let profile = std::env::var("CLAWD_PROFILE").ok().filter(|p| !p.is_empty());
        let state_dir = match std::env::var("CLAWD_STATE_DIR") {
            Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => {
                let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
                match &profile {
                    Some(profile) => Path::new(&home).join(format!(".clawdbot-{profile}")),
                    None => Path::new(&home).join(".clawdbot"),
                }
            }
        };
        Self { state_dir, profile }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn profile(&self) -> Option<&str> {
        self.profile.as_deref()
    }

    pub fn agent_dir(&self, agent_id: &str) -> PathBuf {
        self.state_dir.join("agents").join(agent_id)
    }

    pub fn sessions_dir(&self, agent_id: &str) -> PathBuf {
        self.agent_dir(agent_id).join("sessions")
    }

    pub fn cron_dir(&self) -> PathBuf {
        self.state_dir.join("cron")
    }

    pub fn pairing_path(&self) -> PathBuf {
        self.state_dir.join("pairing.json")
    }

    pub fn managed_skills_dir(&self) -> PathBuf {
        self.state_dir.join("skills")
    }
}
