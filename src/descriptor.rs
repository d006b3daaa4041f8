//! Plugin descriptor validation.
//!
//! A hostable plugin is a directory containing a `package.json` whose
//! `engines` object declares at least one supported runtime. Validation never
//! fails loudly: any problem just makes the location invalid, with the reason
//! logged at debug level.

use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::Path;

/// Manifest file expected at the plugin root.
pub const DESCRIPTOR_FILE: &str = "package.json";

/// Field holding the runtime declarations.
const ENGINES_FIELD: &str = "engines";

/// Runtime keys accepted under `engines`. Either one is enough.
pub const SUPPORTED_ENGINES: &[&str] = &["theiaPlugin", "vscode"];

/// Reports whether a directory holds a plugin the instance can host.
pub trait PluginDescriptorChecker: Send + Sync {
    fn is_valid_plugin(&self, plugin_dir: &Path) -> bool;
}

/// Parsed view of a valid descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginDescriptor {
    pub name: Option<String>,
    pub version: Option<String>,
    /// Supported engine keys found, in [`SUPPORTED_ENGINES`] order.
    pub engines: Vec<&'static str>,
}

#[derive(Deserialize)]
struct RawDescriptor {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    engines: Option<Value>,
}

/// Checks `package.json` at the plugin root.
#[derive(Debug, Default, Clone, Copy)]
pub struct PackageJsonChecker;

impl PackageJsonChecker {
    /// Read and validate the descriptor under `plugin_dir`.
    pub fn describe(&self, plugin_dir: &Path) -> Result<PluginDescriptor, String> {
        let path = plugin_dir.join(DESCRIPTOR_FILE);
        let bytes = std::fs::read(&path)
            .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
        parse_descriptor(&bytes)
    }
}

impl PluginDescriptorChecker for PackageJsonChecker {
    fn is_valid_plugin(&self, plugin_dir: &Path) -> bool {
        match self.describe(plugin_dir) {
            Ok(descriptor) => {
                tracing::debug!(
                    location = %plugin_dir.display(),
                    engines = ?descriptor.engines,
                    "plugin descriptor accepted"
                );
                true
            }
            Err(reason) => {
                tracing::debug!(location = %plugin_dir.display(), "plugin descriptor rejected: {reason}");
                false
            }
        }
    }
}

/// Parse descriptor bytes and check the declared engines.
pub fn parse_descriptor(bytes: &[u8]) -> Result<PluginDescriptor, String> {
    let raw: RawDescriptor =
        serde_json::from_slice(bytes).map_err(|e| format!("invalid JSON: {e}"))?;

    let engines = match raw.engines {
        Some(Value::Object(map)) => supported_engines(&map),
        Some(_) => return Err(format!("\"{ENGINES_FIELD}\" is not an object")),
        None => return Err(format!("no \"{ENGINES_FIELD}\" field")),
    };
    if engines.is_empty() {
        return Err(format!(
            "\"{ENGINES_FIELD}\" declares none of: {}",
            SUPPORTED_ENGINES.join(", ")
        ));
    }

    Ok(PluginDescriptor {
        name: raw.name,
        version: raw.version,
        engines,
    })
}

fn supported_engines(map: &Map<String, Value>) -> Vec<&'static str> {
    SUPPORTED_ENGINES
        .iter()
        .copied()
        .filter(|key| map.contains_key(*key))
        .collect()
}
