//! Embedded default presets: retry policies and alert rules a fresh fabric
//! starts with, generalizing the corpus's embedded invariant-preset library
//! (a TOML file baked in at compile time via `include_str!`).

use fabric_db::config::RetryPolicyConfig;
use serde::Deserialize;

use crate::alerts::{AlertRule, Comparator};

/// A named default retry policy, e.g. one tuned for network-bound
/// resolvers versus one tuned for local computation.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryPolicyPreset {
    pub name: String,
    pub description: String,
    #[serde(flatten)]
    pub policy: RetryPolicyConfig,
}

#[derive(Debug, Deserialize)]
struct RetryPresetLibrary {
    policies: Vec<RetryPolicyPreset>,
}

/// A default alert rule, before the host process's own rules are merged in.
#[derive(Debug, Clone, Deserialize)]
struct AlertRulePreset {
    name: String,
    description: String,
    metric_name: String,
    comparator: Comparator,
    threshold: f64,
    window_secs: u64,
    cooldown_secs: u64,
}

#[derive(Debug, Deserialize)]
struct AlertPresetLibrary {
    rules: Vec<AlertRulePreset>,
}

static RETRY_PRESETS_TOML: &str = include_str!("retry_policies.toml");
static ALERT_PRESETS_TOML: &str = include_str!("alert_rules.toml");

/// Load the embedded retry policy presets.
///
/// # Panics
///
/// Panics if the embedded TOML is malformed -- a compile-time invariant,
/// since the file ships inside the binary.
pub fn load_retry_presets() -> Vec<RetryPolicyPreset> {
    let lib: RetryPresetLibrary =
        toml::from_str(RETRY_PRESETS_TOML).expect("embedded retry_policies.toml is invalid");
    lib.policies
}

pub fn retry_preset(name: &str) -> Option<RetryPolicyPreset> {
    load_retry_presets().into_iter().find(|p| p.name == name)
}

/// Load the embedded default alert rules, ready to seed a fresh
/// [`crate::alerts::AlertManager`].
///
/// # Panics
///
/// Panics if the embedded TOML is malformed.
pub fn load_default_alert_rules() -> Vec<AlertRule> {
    let lib: AlertPresetLibrary =
        toml::from_str(ALERT_PRESETS_TOML).expect("embedded alert_rules.toml is invalid");
    lib.rules
        .into_iter()
        .map(|r| {
            AlertRule::new(r.name, r.metric_name, r.comparator, r.threshold)
                .description(r.description)
                .window(std::time::Duration::from_secs(r.window_secs))
                .cooldown(std::time::Duration::from_secs(r.cooldown_secs))
        })
        .collect()
}
