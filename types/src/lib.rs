//! Core value types for the ArkTS language server wrapper.
//!
//! This crate contains pure value types with no IO, no async, and minimal dependencies.
//! The discovery crate produces them; the bridge serializes them into the
//! `initialize` handshake.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

// ============================================================================
// JSON-RPC method names
// ============================================================================

/// The LSP initialization handshake request.
pub const INITIALIZE_METHOD: &str = "initialize";

/// Out-of-band configuration request the ETS backend waits for after `initialize`.
///
/// Without it the backend treats ArkTS decorators and components as untyped.
pub const ETS_CONFIGURATION_METHOD: &str = "ets/waitForEtsConfigurationChangedRequested";

/// Key under `initializationOptions` carrying the discovered SDK layout.
pub const SDK_OPTIONS_KEY: &str = "ohos";

/// Key under `initializationOptions` carrying the TypeScript options.
pub const TYPESCRIPT_OPTIONS_KEY: &str = "typescript";

// ============================================================================
// Path aliases
// ============================================================================

/// Module-resolution aliases, `pattern -> [templates]`, as in a tsconfig `paths` block.
///
/// Ordered so that serialization is stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PathAliases(BTreeMap<String, Vec<String>>);

impl PathAliases {
    /// Aliases every HarmonyOS SDK exposes relative to `<sdk>/ets`.
    #[must_use]
    pub fn harmony_defaults() -> Self {
        let mut aliases = BTreeMap::new();
        aliases.insert(
            "*".to_string(),
            vec![
                "./api/*".to_string(),
                "./kits/*".to_string(),
                "./arkts/*".to_string(),
            ],
        );
        aliases.insert(
            "@internal/full/*".to_string(),
            vec!["./api/@internal/full/*".to_string()],
        );
        Self(aliases)
    }

    #[must_use]
    pub fn get(&self, pattern: &str) -> Option<&[String]> {
        self.0.get(pattern).map(Vec::as_slice)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ============================================================================
// SDK paths
// ============================================================================

/// Auxiliary SDK paths computed once per session from the TypeScript and SDK roots.
///
/// Serialized with the key names the ETS backend expects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SdkPaths {
    pub sdk_path: PathBuf,
    #[serde(rename = "etsComponentPath")]
    pub component_path: PathBuf,
    #[serde(rename = "etsLoaderConfigPath")]
    pub loader_config_path: PathBuf,
    #[serde(rename = "etsLoaderPath")]
    pub loader_path: PathBuf,
    pub base_url: PathBuf,
    /// Declaration files: TypeScript root first, then components, then loader declarations.
    #[serde(rename = "lib")]
    pub libraries: Vec<PathBuf>,
    #[serde(rename = "paths")]
    pub path_aliases: PathAliases,
}

impl SdkPaths {
    /// Derive the fixed SDK layout under `sdk_root`. `libraries` starts empty.
    #[must_use]
    pub fn layout(sdk_root: &Path) -> Self {
        let base_url = sdk_root.join("ets");
        let loader_path = base_url.join("build-tools").join("ets-loader");
        Self {
            sdk_path: sdk_root.to_path_buf(),
            component_path: base_url.join("component"),
            loader_config_path: loader_path.join("tsconfig.json"),
            loader_path,
            base_url,
            libraries: Vec::new(),
            path_aliases: PathAliases::harmony_defaults(),
        }
    }

    /// Directory holding the loader's own declaration files.
    #[must_use]
    pub fn loader_declarations(&self) -> PathBuf {
        self.loader_path.join("declarations")
    }
}

// ============================================================================
// TypeScript options
// ============================================================================

/// The minimized `typescript` object forwarded to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeScriptOptions {
    pub tsdk: String,
}
