//! Backend binary provisioning. Downloading and verification live elsewhere; this resolves
//! an already-installed binary from config, environment or PATH.

use std::io;
use std::path::PathBuf;

use crate::config::Config;

pub trait BinaryProvider {
    fn ensure_binary(&self) -> io::Result<PathBuf>;
    fn is_binary_installed(&self) -> bool {
        self.ensure_binary().is_ok()
    }
}

/// Resolution order: explicit path (config or CCS_CLIPROXY_BINARY),
/// `<config dir>/bin/<name>`, PATH.
#[derive(Debug, Clone)]
pub struct PathBinaryProvider {
    explicit: Option<PathBuf>,
    local_bin: PathBuf,
    binary_name: String,
}

impl PathBinaryProvider {
    pub fn new(explicit: Option<PathBuf>, local_bin: PathBuf, binary_name: &str) -> Self {
        PathBinaryProvider {
            explicit,
            local_bin,
            binary_name: binary_name.to_string(),
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        PathBinaryProvider::new(
            cfg.backend.binary.clone(),
            cfg.config_dir.join("bin"),
            &cfg.backend.binary_name,
        )
    }
}

impl BinaryProvider for PathBinaryProvider {
    fn ensure_binary(&self) -> io::Result<PathBuf> {
        if let Some(p) = &self.explicit {
            if p.is_file() {
                return Ok(p.clone());
            }
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("configured CLIProxy binary not found: {}", p.display()),
            ));
        }
        let local = self.local_bin.join(&self.binary_name);
        if local.is_file() {
            return Ok(local);
        }
        which::which(&self.binary_name).map_err(|_| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!(
                    "{} not found in {} or on PATH",
                    self.binary_name,
                    self.local_bin.display()
                ),
            )
        })
    }
}
