use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SpendsortError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_data_dir_string")]
    pub data_dir: String,
    #[serde(default)]
    pub default_owner: Option<String>,
    /// Completion providers in fallback order.
    #[serde(default)]
    pub providers: Vec<ProviderSettings>,
    #[serde(default)]
    pub categorization: CategorizationSettings,
    #[serde(default)]
    pub import: ImportSettings,
    #[serde(default)]
    pub sign_policy: SignPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    pub kind: ProviderKind,
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
}

impl ProviderSettings {
    /// Literal key first, then the named environment variable. `None` means
    /// the provider is not configured.
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(key) = self.api_key.as_ref().filter(|k| !k.trim().is_empty()) {
            return Some(key.clone());
        }
        let env_name = self.api_key_env.as_deref()?;
        std::env::var(env_name).ok().filter(|k| !k.trim().is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CategorizationSettings {
    pub min_confidence: f64,
    pub ai_fallback: bool,
    pub concurrency: usize,
    pub history_confidence: f64,
}

impl Default for CategorizationSettings {
    fn default() -> Self {
        Self {
            min_confidence: 0.7,
            ai_fallback: true,
            concurrency: 4,
            history_confidence: 0.85,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportSettings {
    pub worker_concurrency: usize,
    pub preview_rows: usize,
    pub stats_sample_rows: usize,
    pub numeric_probe_rows: usize,
    pub numeric_min_hits: usize,
    pub pdf_char_budget: usize,
    pub low_text_chars_per_page: usize,
    pub statement_max_output_tokens: u32,
}

impl Default for ImportSettings {
    fn default() -> Self {
        Self {
            worker_concurrency: 2,
            preview_rows: 20,
            stats_sample_rows: 200,
            numeric_probe_rows: 50,
            numeric_min_hits: 5,
            pdf_char_budget: 30_000,
            low_text_chars_per_page: 100,
            statement_max_output_tokens: 16_000,
        }
    }
}

/// Thresholds for guessing sign polarity from the share of positive amounts
/// when the statement kind is unknown.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct SignPolicy {
    pub reversal_threshold: f64,
    pub standard_threshold: f64,
}

impl Default for SignPolicy {
    fn default() -> Self {
        Self {
            reversal_threshold: 0.8,
            standard_threshold: 0.2,
        }
    }
}

fn default_providers() -> Vec<ProviderSettings> {
    vec![
        ProviderSettings {
            kind: ProviderKind::OpenAi,
            model: "gpt-4o-mini".to_string(),
            api_key: None,
            api_key_env: Some("OPENAI_API_KEY".to_string()),
            base_url: None,
        },
        ProviderSettings {
            kind: ProviderKind::Anthropic,
            model: "claude-3-5-haiku-latest".to_string(),
            api_key: None,
            api_key_env: Some("ANTHROPIC_API_KEY".to_string()),
            base_url: None,
        },
    ]
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir_string(),
            default_owner: None,
            providers: default_providers(),
            categorization: CategorizationSettings::default(),
            import: ImportSettings::default(),
            sign_policy: SignPolicy::default(),
        }
    }
}

fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("spendsort")
}

fn settings_path() -> PathBuf {
    config_dir().join("settings.json")
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("Documents")
        .join("spendsort")
}

fn default_data_dir_string() -> String {
    default_data_dir().to_string_lossy().to_string()
}

pub fn load_settings() -> Settings {
    let path = settings_path();
    let mut settings = if path.exists() {
        let content = std::fs::read_to_string(&path).unwrap_or_default();
        serde_json::from_str(&content).unwrap_or_default()
    } else {
        Settings::default()
    };
    if let Ok(dir) = std::env::var("SPENDSORT_DATA_DIR") {
        settings.data_dir = dir;
    }
    if let Ok(owner) = std::env::var("SPENDSORT_OWNER") {
        settings.default_owner = Some(owner);
    }
    settings
}

pub fn save_settings(settings: &Settings) -> Result<()> {
    let dir = config_dir();
    std::fs::create_dir_all(&dir)?;
    let json = serde_json::to_string_pretty(settings)
        .map_err(|e| SpendsortError::Settings(e.to_string()))?;
    std::fs::write(settings_path(), format!("{json}\n"))?;
    Ok(())
}

pub fn database_path(settings: &Settings) -> PathBuf {
    PathBuf::from(&settings.data_dir).join("spendsort.db")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let mut settings = Settings::default();
        settings.data_dir = "/tmp/test".to_string();
        settings.default_owner = Some("owner-1".to_string());
        settings.categorization.min_confidence = 0.6;
        let json = serde_json::to_string_pretty(&settings).unwrap();
        std::fs::write(&path, &json).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        let loaded: Settings = serde_json::from_str(&content).unwrap();
        assert_eq!(loaded.data_dir, "/tmp/test");
        assert_eq!(loaded.default_owner.as_deref(), Some("owner-1"));
        assert_eq!(loaded.categorization.min_confidence, 0.6);
        assert_eq!(loaded.providers.len(), 2);
    }

    #[test]
    fn test_load_merges_with_defaults() {
        let json = r#"{"data_dir": "/tmp/test", "categorization": {"ai_fallback": false}}"#;
        let s: Settings = serde_json::from_str(json).unwrap();
        assert!(!s.categorization.ai_fallback);
        assert_eq!(s.categorization.min_confidence, 0.7);
        assert_eq!(s.import.pdf_char_budget, 30_000);
        assert_eq!(s.sign_policy.reversal_threshold, 0.8);
        assert!(s.providers.is_empty());
    }

    #[test]
    fn test_provider_without_key_is_unconfigured() {
        let provider = ProviderSettings {
            kind: ProviderKind::OpenAi,
            model: "m".into(),
            api_key: None,
            api_key_env: Some("SPENDSORT_TEST_UNSET_KEY_VAR".into()),
            base_url: None,
        };
        assert!(provider.resolve_api_key().is_none());
        let literal = ProviderSettings {
            api_key: Some("sk-test".into()),
            ..provider
        };
        assert_eq!(literal.resolve_api_key().as_deref(), Some("sk-test"));
    }
}
