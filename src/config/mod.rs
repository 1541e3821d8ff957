//! Configuration loading and settings types.

mod settings;

pub use settings::{
    expand_env_vars, CacheSettings, CatalogSettings, EmbeddingSettings, KnowledgeSettings,
    LlmSettings, Settings, SettingsError, TableKeywordRule,
};
