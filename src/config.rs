//! Server configuration.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, Result};

/// Transport the listener binds on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Unix,
}

impl FromStr for Network {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Network> {
        match s {
            "tcp" => Ok(Network::Tcp),
            "unix" => Ok(Network::Unix),
            other => Err(anyhow!("unknown network '{}' (expected tcp or unix)", other)),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Tcp => write!(f, "tcp"),
            Network::Unix => write!(f, "unix"),
        }
    }
}

/// Everything the server needs to come up.
#[derive(Debug, Clone)]
pub struct Config {
    /// The backing directory being served.
    pub root: PathBuf,
    /// Listen address: `host:port` for tcp, a path for unix.
    pub listen: String,
    pub network: Network,
    /// Owner assigned to files without a sidecar.
    pub default_user: String,
    /// Print every decoded T-message and encoded R-message.
    pub debug: bool,
}

impl Config {
    /// Validate and canonicalize. The root must exist and be a directory.
    pub fn new(
        root: PathBuf,
        network: Network,
        listen: impl Into<String>,
        default_user: impl Into<String>,
    ) -> Result<Config> {
        if !root.exists() {
            return Err(anyhow!("directory does not exist: {}", root.display()));
        }
        if !root.is_dir() {
            return Err(anyhow!("path is not a directory: {}", root.display()));
        }
        let root = root.canonicalize()?;
        Ok(Config {
            root,
            listen: listen.into(),
            network,
            default_user: default_user.into(),
            debug: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn network_parses_both_transports() {
        assert_eq!("tcp".parse::<Network>().unwrap(), Network::Tcp);
        assert_eq!("unix".parse::<Network>().unwrap(), Network::Unix);
        assert!("udp".parse::<Network>().is_err());
    }

    #[test]
    fn config_requires_existing_directory() {
        let dir = tempdir().unwrap();
        let ok = Config::new(dir.path().to_path_buf(), Network::Tcp, "127.0.0.1:0", "adm");
        assert!(ok.is_ok());

        let missing = dir.path().join("nope");
        assert!(Config::new(missing, Network::Tcp, "127.0.0.1:0", "adm").is_err());

        let file = dir.path().join("f");
        std::fs::write(&file, "x").unwrap();
        assert!(Config::new(file, Network::Tcp, "127.0.0.1:0", "adm").is_err());
    }
}
