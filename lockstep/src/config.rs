use std::fs;
use std::path::{Path, PathBuf};

use lockstep_backend_cpp::EmitOptions;
use lockstep_core::CheckerConfig;
use miette::Diagnostic;
use thiserror::Error;

pub const CONFIG_FILE: &str = "lockstep.toml";

#[derive(Debug, Error, Diagnostic)]
#[error("config error: {message}")]
#[diagnostic(code(lockstep::config))]
pub struct ConfigError {
    pub message: String,
}

#[derive(Clone, Debug, Default)]
pub struct ResolvedConfig {
    pub config_path: Option<PathBuf>,
    pub checker: CheckerConfig,
    pub emit: EmitOptions,
}

#[derive(Clone, Debug, Default, serde::Deserialize)]
struct ConfigFile {
    #[serde(default)]
    checker: CheckerConfig,

    #[serde(default)]
    emit: EmitOptions,
}

/// Nearest `lockstep.toml`, starting in the input's directory and walking up.
pub fn find_config(start: &Path) -> Option<PathBuf> {
    let mut cur = if start.is_file() {
        start.parent()?.to_path_buf()
    } else {
        start.to_path_buf()
    };

    loop {
        let candidate = cur.join(CONFIG_FILE);
        if candidate.is_file() {
            return Some(candidate);
        }
        match cur.parent() {
            Some(p) => cur = p.to_path_buf(),
            None => return None,
        }
    }
}

/// Load the config governing `start`, or defaults when there is none.
pub fn load_config(start: &Path) -> Result<ResolvedConfig, ConfigError> {
    match find_config(start) {
        Some(path) => load_config_file(&path),
        None => Ok(ResolvedConfig::default()),
    }
}

pub fn load_config_file(path: &Path) -> Result<ResolvedConfig, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|e| ConfigError {
        message: format!("failed to read {}: {e}", path.display()),
    })?;
    let parsed: ConfigFile = toml::from_str(&raw).map_err(|e| ConfigError {
        message: format!("failed to parse {}: {e}", path.display()),
    })?;
    if parsed.emit.header_name.trim().is_empty() {
        return Err(ConfigError {
            message: format!("{}: emit.header_name must not be empty", path.display()),
        });
    }
    Ok(ResolvedConfig {
        config_path: Some(path.to_path_buf()),
        checker: parsed.checker,
        emit: parsed.emit,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use lockstep_ast::LockMode;

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("lockstep-config-{}-{name}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn missing_config_means_defaults() {
        let dir = scratch("missing");
        let cfg = load_config(&dir).unwrap();
        assert!(cfg.config_path.is_none());
        assert_eq!(cfg.checker.default_lock_mode, LockMode::NoLock);
        assert_eq!(cfg.emit.header_name, "lockstep_rt.h");
    }

    #[test]
    fn config_is_found_from_a_nested_input() {
        let dir = scratch("nested");
        fs::write(
            dir.join(CONFIG_FILE),
            "[checker]\ndefault_lock_mode = \"checklock\"\nmax_diagnostics = 3\n\n[emit]\nheader_name = \"rt.h\"\n",
        )
        .unwrap();
        let sub = dir.join("trees");
        fs::create_dir_all(&sub).unwrap();
        let input = sub.join("main.json");
        fs::write(&input, "{}").unwrap();

        let cfg = load_config(&input).unwrap();
        assert_eq!(cfg.config_path.as_deref(), Some(dir.join(CONFIG_FILE).as_path()));
        assert_eq!(cfg.checker.default_lock_mode, LockMode::CheckLock);
        assert_eq!(cfg.checker.max_diagnostics, 3);
        assert_eq!(cfg.emit.header_name, "rt.h");
        assert!(cfg.emit.runtime_header);
    }

    #[test]
    fn malformed_config_is_reported() {
        let dir = scratch("malformed");
        fs::write(dir.join(CONFIG_FILE), "[checker]\ndefault_lock_mode = \"sometimes\"\n").unwrap();
        let err = load_config(&dir).unwrap_err();
        assert!(err.message.contains("failed to parse"));
    }

    #[test]
    fn empty_header_name_is_rejected() {
        let dir = scratch("header");
        fs::write(dir.join(CONFIG_FILE), "[emit]\nheader_name = \"\"\n").unwrap();
        assert!(load_config(&dir).is_err());
    }
}
