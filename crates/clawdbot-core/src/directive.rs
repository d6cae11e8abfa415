//! Inline directive extraction (`/think`, `/verbose`).
//!
//! Directives modify the agent's behavior for the current turn only. Each
//! directive is stripped at most once per invocation; a directive with an
//! unrecognized argument is left in the text untouched.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThinkLevel {
    Off,
    Low,
    Medium,
    High,
    Max,
}

impl ThinkLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Max => "max",
        }
    }

    fn from_arg(arg: &str) -> Option<Self> {
        match arg {
            "off" => Some(Self::Off),
            "min" | "minimal" | "low" => Some(Self::Low),
            "thinkhard" | "think-hard" | "medium" | "mid" | "med" => Some(Self::Medium),
            "thinkharder" | "high" => Some(Self::High),
            "ultra" | "ultrathink" | "max" => Some(Self::Max),
            _ => None,
        }
    }
}

impl std::str::FromStr for ThinkLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_arg(&s.to_lowercase())
            .ok_or_else(|| anyhow::anyhow!("unknown thinking level: {s}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerboseLevel {
    On,
    Off,
}

impl VerboseLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::On => "on",
            Self::Off => "off",
        }
    }

    fn from_arg(arg: &str) -> Option<Self> {
        match arg {
            "on" | "true" | "yes" | "1" | "full" => Some(Self::On),
            "off" | "false" | "no" | "0" => Some(Self::Off),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Directives {
    pub cleaned: String,
    pub think_level: Option<ThinkLevel>,
    pub verbose_level: Option<VerboseLevel>,
    pub has_directives: bool,
}

fn think_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(^|\s)/(?:think(?:ing)?|t)\b:?\s+([a-z0-9-]+)").expect("think regex")
    })
}

fn verbose_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(^|\s)/(?:verbose|v)\b:?\s+([a-z0-9-]+)").expect("verbose regex")
    })
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Extract directives from user text. Never fails; unknown arguments leave
/// the directive in place with no level set.
pub fn extract_directives(text: &str) -> Directives {
    let mut out = Directives {
        cleaned: text.to_string(),
        ..Default::default()
    };

    if let Some(caps) = think_re().captures(&out.cleaned) {
        let arg = caps.get(2).map(|m| m.as_str().to_lowercase());
        if let Some(level) = arg.as_deref().and_then(ThinkLevel::from_arg) {
            out.think_level = Some(level);
            out.has_directives = true;
            let full = caps.get(0).unwrap();
            let boundary = caps.get(1).unwrap().as_str().to_string();
            out.cleaned
                .replace_range(full.start()..full.end(), &boundary);
        }
    }

    if let Some(caps) = verbose_re().captures(&out.cleaned) {
        let arg = caps.get(2).map(|m| m.as_str().to_lowercase());
        if let Some(level) = arg.as_deref().and_then(VerboseLevel::from_arg) {
            out.verbose_level = Some(level);
            out.has_directives = true;
            let full = caps.get(0).unwrap();
            let boundary = caps.get(1).unwrap().as_str().to_string();
            out.cleaned
                .replace_range(full.start()..full.end(), &boundary);
        }
    }

    out.cleaned = collapse_whitespace(&out.cleaned);
    out
}
