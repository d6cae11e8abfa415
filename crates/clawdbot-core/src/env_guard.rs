//! Scoped process-environment overrides.
//!
//! The process environment is global mutable state, so skill overrides are
//! applied under a process-wide async mutex and undone by the guard's
//! `Drop` — the environment is byte-identical after every run, on every
//! exit path including panics and cancellation.

use std::sync::{Arc, OnceLock};

use tokio::sync::{Mutex, OwnedMutexGuard};

fn env_gate() -> Arc<Mutex<()>> {
    static GATE: OnceLock<Arc<Mutex<()>>> = OnceLock::new();
    GATE.get_or_init(|| Arc::new(Mutex::new(()))).clone()
}

/// One variable to push: `set_always` forces the value (explicit
/// credentials), otherwise the variable is only set when absent.
#[derive(Debug, Clone)]
pub struct EnvOverride {
    pub key: String,
    pub value: String,
    pub set_always: bool,
}

impl EnvOverride {
    pub fn if_unset(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            set_always: false,
        }
    }

    pub fn always(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            set_always: true,
        }
    }
}

pub struct EnvGuard {
    saved: Vec<(String, Option<String>)>,
    _permit: OwnedMutexGuard<()>,
}

/// Apply overrides and return the restoring guard. Holds the process-wide
/// env gate until dropped, so overlapping agent runs cannot interleave
/// their environment mutations.
pub async fn apply_env_overrides(overrides: Vec<EnvOverride>) -> EnvGuard {
    let permit = env_gate().lock_owned().await;

    let mut saved = Vec::new();
    for o in overrides {
        let previous = std::env::var(&o.key).ok();
        if previous.is_some() && !o.set_always {
            continue;
        }
        saved.push((o.key.clone(), previous));
        std::env::set_var(&o.key, &o.value);
    }

    EnvGuard {
        saved,
        _permit: permit,
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, previous) in self.saved.drain(..).rev() {
            match previous {
                Some(value) => std::env::set_var(&key, value),
                None => std::env::remove_var(&key),
            }
        }
    }
}
