//! Plugin registry: capability-scoped extension surface.
//!
//! Plugins are self-describing bundles. Loading is gated by the
//! allow/deny config; a plugin whose config fails its own schema is
//! marked errored and none of its registrations are applied.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::config::PluginsSection;

/// Duck-typed config validator; returns the parsed config or an error
/// surfaced as a load diagnostic.
pub trait PluginConfigSchema: Send + Sync {
    fn parse(&self, value: &Value) -> Result<Value>;
}

#[async_trait]
pub trait PluginTool: Send + Sync {
    fn name(&self) -> &str;
    fn parameters(&self) -> Value;
    async fn execute(&self, args: Value) -> Result<Value>;
}

#[async_trait]
pub trait GatewayMethod: Send + Sync {
    async fn call(&self, params: Value) -> Result<Value>;
}

#[async_trait]
pub trait PluginService: Send + Sync {
    fn id(&self) -> &str;
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
}

pub type CliHook = Arc<dyn Fn(&[String]) -> Result<()> + Send + Sync>;

pub trait Plugin: Send + Sync {
    fn id(&self) -> &str;
    fn name(&self) -> Option<&str> {
        None
    }
    fn description(&self) -> Option<&str> {
        None
    }
    fn config_schema(&self) -> Option<&dyn PluginConfigSchema> {
        None
    }
    fn register(&self, api: &mut PluginApi) -> Result<()>;
}

/// Registration surface handed to `Plugin::register`. Registrations are
/// staged; the registry commits them only when the plugin loads cleanly.
pub struct PluginApi {
    plugin_id: String,
    pub plugin_config: Option<Value>,
    gateway_methods: Vec<(String, Arc<dyn GatewayMethod>)>,
    tools: Vec<Arc<dyn PluginTool>>,
    cli_hooks: Vec<CliHook>,
    services: Vec<Arc<dyn PluginService>>,
}

impl PluginApi {
    fn new(plugin_id: &str, plugin_config: Option<Value>) -> Self {
        Self {
            plugin_id: plugin_id.to_string(),
            plugin_config,
            gateway_methods: Vec::new(),
            tools: Vec::new(),
            cli_hooks: Vec::new(),
            services: Vec::new(),
        }
    }

    pub fn register_gateway_method(&mut self, name: &str, method: Arc<dyn GatewayMethod>) {
        self.gateway_methods.push((name.to_string(), method));
    }

    pub fn register_tool(&mut self, tool: Arc<dyn PluginTool>) {
        self.tools.push(tool);
    }

    pub fn register_cli(&mut self, hook: CliHook) {
        self.cli_hooks.push(hook);
    }

    pub fn register_service(&mut self, service: Arc<dyn PluginService>) {
        self.services.push(service);
    }

    pub fn log(&self, message: &str) {
        tracing::info!(plugin = %self.plugin_id, "{message}");
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginStatus {
    Loaded,
    /// Excluded by allow/deny config or a disabled entry.
    Gated,
    Error(String),
}

#[derive(Debug, Clone)]
pub struct PluginDiagnostic {
    pub plugin_id: String,
    pub status: PluginStatus,
}

#[derive(Default)]
pub struct PluginRegistry {
    tools: HashMap<String, Arc<dyn PluginTool>>,
    gateway_methods: HashMap<String, Arc<dyn GatewayMethod>>,
    cli_hooks: Vec<CliHook>,
    services: Vec<Arc<dyn PluginService>>,
    diagnostics: Vec<PluginDiagnostic>,
}

impl PluginRegistry {
    /// Load plugins under the config gating rules. Core tool names are
    /// reserved; a colliding plugin tool is rejected with a diagnostic.
    pub fn load(
        plugins: Vec<Arc<dyn Plugin>>,
        config: &PluginsSection,
        reserved_tool_names: &[&str],
    ) -> Self {
        let mut registry = Self::default();

        for plugin in plugins {
            let id = plugin.id().to_string();

            if !gate_allows(config, &id) {
                registry.diagnostics.push(PluginDiagnostic {
                    plugin_id: id,
                    status: PluginStatus::Gated,
                });
                continue;
            }

            let raw_config = config
                .entries
                .get(&id)
                .and_then(|entry| entry.config.clone());
            let parsed_config = match (plugin.config_schema(), raw_config) {
                (Some(schema), Some(raw)) => match schema.parse(&raw) {
                    Ok(parsed) => Some(parsed),
                    Err(err) => {
                        tracing::warn!(plugin = %id, "plugin config rejected: {err:#}");
                        registry.diagnostics.push(PluginDiagnostic {
                            plugin_id: id,
                            status: PluginStatus::Error(format!("config: {err}")),
                        });
                        continue;
                    }
                },
                (_, raw) => raw,
            };

            let mut api = PluginApi::new(&id, parsed_config);
            if let Err(err) = plugin.register(&mut api) {
                tracing::warn!(plugin = %id, "plugin registration failed: {err:#}");
                registry.diagnostics.push(PluginDiagnostic {
                    plugin_id: id,
                    status: PluginStatus::Error(err.to_string()),
                });
                continue;
            }

            // Tool collision check before committing anything.
            let mut collision = None;
            for tool in &api.tools {
                let name = tool.name();
                if reserved_tool_names.contains(&name) || registry.tools.contains_key(name) {
                    collision = Some(name.to_string());
                    break;
                }
            }
            if let Some(name) = collision {
                registry.diagnostics.push(PluginDiagnostic {
                    plugin_id: id,
                    status: PluginStatus::Error(format!("tool name collision: {name}")),
                });
                continue;
            }

            for tool in api.tools {
                registry.tools.insert(tool.name().to_string(), tool);
            }
            for (name, method) in api.gateway_methods {
                registry.gateway_methods.insert(name, method);
            }
            registry.cli_hooks.extend(api.cli_hooks);
            registry.services.extend(api.services);
            registry.diagnostics.push(PluginDiagnostic {
                plugin_id: id,
                status: PluginStatus::Loaded,
            });
        }

        registry
    }

    pub fn tool(&self, name: &str) -> Option<&Arc<dyn PluginTool>> {
        self.tools.get(name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn gateway_method(&self, name: &str) -> Option<&Arc<dyn GatewayMethod>> {
        self.gateway_methods.get(name)
    }

    pub fn services(&self) -> &[Arc<dyn PluginService>] {
        &self.services
    }

    pub fn cli_hooks(&self) -> &[CliHook] {
        &self.cli_hooks
    }

    pub fn diagnostics(&self) -> &[PluginDiagnostic] {
        &self.diagnostics
    }

    pub fn status(&self, plugin_id: &str) -> Option<&PluginStatus> {
        self.diagnostics
            .iter()
            .find(|d| d.plugin_id == plugin_id)
            .map(|d| &d.status)
    }
}

fn gate_allows(config: &PluginsSection, id: &str) -> bool {
    if config.deny.iter().any(|d| d == id) {
        return false;
    }
    if !config.allow.is_empty() && !config.allow.iter().any(|a| a == id) {
        return false;
    }
    if let Some(entry) = config.entries.get(id) {
        if entry.enabled == Some(false) {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::config::PluginEntry;

    struct EchoTool {
        name: String,
    }

    #[async_trait]
    impl PluginTool for EchoTool {
        fn name(&self) -> &str {
            &self.name
        }
        fn parameters(&self) -> Value {
            json!({"type": "object"})
        }
        async fn execute(&self, args: Value) -> Result<Value> {
            Ok(args)
        }
    }

    struct StrictSchema;

    impl PluginConfigSchema for StrictSchema {
        fn parse(&self, value: &Value) -> Result<Value> {
            if value.get("port").and_then(Value::as_u64).is_none() {
                anyhow::bail!("port is required");
            }
            Ok(value.clone())
        }
    }

    struct TestPlugin {
        id: String,
        tool_names: Vec<String>,
        strict: bool,
    }

    impl Plugin for TestPlugin {
        fn id(&self) -> &str {
            &self.id
        }
        fn config_schema(&self) -> Option<&dyn PluginConfigSchema> {
            self.strict.then_some(&StrictSchema as &dyn PluginConfigSchema)
        }
        fn register(&self, api: &mut PluginApi) -> Result<()> {
            for name in &self.tool_names {
                api.register_tool(Arc::new(EchoTool { name: name.clone() }));
            }
            Ok(())
        }
    }

    fn plugin(id: &str, tools: &[&str]) -> Arc<dyn Plugin> {
        Arc::new(TestPlugin {
            id: id.into(),
            tool_names: tools.iter().map(|t| t.to_string()).collect(),
            strict: false,
        })
    }

    #[test]
    fn loads_and_registers_tools() {
        let registry = PluginRegistry::load(
            vec![plugin("metrics", &["metrics_report"])],
            &PluginsSection::default(),
            &[],
        );
        assert_eq!(registry.status("metrics"), Some(&PluginStatus::Loaded));
        assert!(registry.tool("metrics_report").is_some());
    }

    #[test]
    fn deny_list_gates_plugin() {
        let mut config = PluginsSection::default();
        config.deny.push("metrics".into());
        let registry =
            PluginRegistry::load(vec![plugin("metrics", &["t"])], &config, &[]);
        assert_eq!(registry.status("metrics"), Some(&PluginStatus::Gated));
        assert!(registry.tool("t").is_none());
    }

    #[test]
    fn allow_list_excludes_unlisted() {
        let mut config = PluginsSection::default();
        config.allow.push("other".into());
        let registry =
            PluginRegistry::load(vec![plugin("metrics", &["t"])], &config, &[]);
        assert_eq!(registry.status("metrics"), Some(&PluginStatus::Gated));
    }

    #[test]
    fn disabled_entry_gates_plugin() {
        let mut config = PluginsSection::default();
        config.entries.insert(
            "metrics".into(),
            PluginEntry {
                enabled: Some(false),
                config: None,
            },
        );
        let registry =
            PluginRegistry::load(vec![plugin("metrics", &["t"])], &config, &[]);
        assert_eq!(registry.status("metrics"), Some(&PluginStatus::Gated));
    }

    #[test]
    fn config_schema_failure_isolates_plugin() {
        let strict: Arc<dyn Plugin> = Arc::new(TestPlugin {
            id: "metrics".into(),
            tool_names: vec!["metrics_report".into()],
            strict: true,
        });
        let mut config = PluginsSection::default();
        config.entries.insert(
            "metrics".into(),
            PluginEntry {
                enabled: None,
                config: Some(json!({"host": "x"})),
            },
        );

        let registry =
            PluginRegistry::load(vec![strict, plugin("other", &["other_tool"])], &config, &[]);
        assert!(matches!(
            registry.status("metrics"),
            Some(PluginStatus::Error(msg)) if msg.contains("port is required")
        ));
        // Registrations from the failed plugin are not applied; the
        // healthy plugin still loads.
        assert!(registry.tool("metrics_report").is_none());
        assert!(registry.tool("other_tool").is_some());
    }

    #[test]
    fn valid_config_is_passed_through() {
        let strict: Arc<dyn Plugin> = Arc::new(TestPlugin {
            id: "metrics".into(),
            tool_names: vec![],
            strict: true,
        });
        let mut config = PluginsSection::default();
        config.entries.insert(
            "metrics".into(),
            PluginEntry {
                enabled: None,
                config: Some(json!({"port": 9100})),
            },
        );
        let registry = PluginRegistry::load(vec![strict], &config, &[]);
        assert_eq!(registry.status("metrics"), Some(&PluginStatus::Loaded));
    }

    #[test]
    fn tool_collision_with_core_rejected() {
        let registry = PluginRegistry::load(
            vec![plugin("shadow", &["bash"])],
            &PluginsSection::default(),
            &["read", "bash"],
        );
        assert!(matches!(
            registry.status("shadow"),
            Some(PluginStatus::Error(msg)) if msg.contains("bash")
        ));
    }

    #[test]
    fn tool_collision_between_plugins_rejected() {
        let registry = PluginRegistry::load(
            vec![plugin("first", &["shared"]), plugin("second", &["shared"])],
            &PluginsSection::default(),
            &[],
        );
        assert_eq!(registry.status("first"), Some(&PluginStatus::Loaded));
        assert!(matches!(
            registry.status("second"),
            Some(PluginStatus::Error(_))
        ));
        assert_eq!(registry.tool_names(), vec!["shared"]);
    }
}
