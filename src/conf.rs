//! Runtime configuration.
//!
//! Grounded on `axm/src/conf.rs` (`PropDef`/`Category`/`ALL_PROPS`, a dotfile
//! of `key=value` lines with `#` comments). That table carries dozens of
//! GC/JIT/inline-cache properties this engine doesn't have; `IonConf` keeps
//! only the levers this engine actually has: the call-depth guard, an
//! opcode trace toggle wired to the `tracing` integration, and the tab width
//! used when the lexer reports source columns.

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::path::PathBuf;

/// One named, documented configuration property.
#[derive(Debug, Clone, Copy)]
pub struct PropDef {
    pub name: &'static str,
    pub default: &'static str,
    pub description: &'static str,
}

pub static ALL_PROPS: &[PropDef] = &[
    PropDef {
        name: "max_call_depth",
        default: "256",
        description: "Maximum script call stack depth before a runtime error is raised. \
                      Guards the activation-record stack against runaway recursion.",
    },
    PropDef {
        name: "trace_opcodes",
        default: "off",
        description: "Emit a trace-level tracing event for every opcode the VM steps. \
                      Intended for debugging the compiler/VM, not for production use.",
    },
    PropDef {
        name: "source_tab_width",
        default: "4",
        description: "Column width a tab character counts as when the lexer reports \
                      source positions in diagnostics.",
    },
];

/// Name -> default lookup, built once. `ALL_PROPS` is small enough that a
/// linear scan would be fine too, but every load/env-override path on every
/// `Runtime::new()` hits this, so it's worth not re-scanning per call.
static DEFAULTS_BY_NAME: Lazy<HashMap<&'static str, &'static str>> =
    Lazy::new(|| ALL_PROPS.iter().map(|p| (p.name, p.default)).collect());

fn prop_default(name: &str) -> &'static str {
    DEFAULTS_BY_NAME.get(name).copied().unwrap_or("")
}

/// Live configuration, loaded from a dotfile and/or environment variables and
/// then read out into typed accessors.
#[derive(Debug, Clone)]
pub struct IonConf {
    values: HashMap<String, String>,
}

impl Default for IonConf {
    fn default() -> Self {
        let mut values = HashMap::new();
        for prop in ALL_PROPS {
            values.insert(prop.name.to_string(), prop.default.to_string());
        }
        IonConf { values }
    }
}

impl IonConf {
    /// Loads `~/.config/ionscript/conf.toml` over the defaults, if present.
    /// Missing file or missing home directory both fall back to defaults
    /// silently — this is a convenience layer, not a required file.
    pub fn load() -> Self {
        let mut conf = Self::default();
        if let Some(path) = Self::config_path() {
            if let Ok(contents) = std::fs::read_to_string(&path) {
                conf.apply_lines(&contents);
            }
        }
        conf
    }

    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("ionscript").join("conf.toml"))
    }

    fn apply_lines(&mut self, contents: &str) {
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((k, v)) = line.split_once('=') {
                self.values.insert(k.trim().to_string(), v.trim().to_string());
            }
        }
    }

    /// Overrides each known property from an `IONSCRIPT_<NAME>` environment
    /// variable (uppercased), for embedding in test harnesses without
    /// touching the filesystem.
    pub fn from_env(mut self) -> Self {
        for prop in ALL_PROPS {
            let var = format!("IONSCRIPT_{}", prop.name.to_uppercase());
            if let Ok(value) = std::env::var(&var) {
                self.values.insert(prop.name.to_string(), value);
            }
        }
        self
    }

    fn get(&self, key: &str) -> &str {
        self.values.get(key).map(|s| s.as_str()).unwrap_or_else(|| prop_default(key))
    }

    fn get_bool(&self, key: &str) -> bool {
        matches!(self.get(key), "on" | "true" | "yes" | "1")
    }

    fn get_usize(&self, key: &str, default: usize) -> usize {
        self.get(key).parse().unwrap_or(default)
    }

    pub fn max_call_depth(&self) -> usize {
        self.get_usize("max_call_depth", 256)
    }

    pub fn trace_opcodes(&self) -> bool {
        self.get_bool("trace_opcodes")
    }

    pub fn source_tab_width(&self) -> usize {
        self.get_usize("source_tab_width", 4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_all_props_table() {
        let conf = IonConf::default();
        assert_eq!(conf.max_call_depth(), 256);
        assert!(!conf.trace_opcodes());
        assert_eq!(conf.source_tab_width(), 4);
    }

    #[test]
    fn from_env_overrides_individual_properties() {
        std::env::set_var("IONSCRIPT_MAX_CALL_DEPTH", "64");
        std::env::set_var("IONSCRIPT_TRACE_OPCODES", "on");
        let conf = IonConf::default().from_env();
        assert_eq!(conf.max_call_depth(), 64);
        assert!(conf.trace_opcodes());
        assert_eq!(conf.source_tab_width(), 4);
        std::env::remove_var("IONSCRIPT_MAX_CALL_DEPTH");
        std::env::remove_var("IONSCRIPT_TRACE_OPCODES");
    }

    #[test]
    fn unknown_lines_in_dotfile_are_ignored() {
        let mut conf = IonConf::default();
        conf.apply_lines("# a comment\n\nmax_call_depth=128\nnot_a_real_key=xyz\n");
        assert_eq!(conf.max_call_depth(), 128);
    }
}
