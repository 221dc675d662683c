//! Command line and effective configuration

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

use strand_core::StrandConfig;

/// Serve one Strand Store over the cross-store protocol
#[derive(Debug, Parser)]
#[command(name = "strand-node", version)]
#[command(about = "Strand timeline store daemon", long_about = None)]
pub struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// RPC listen address, overrides `rpc.bind`
    #[arg(long)]
    pub bind: Option<String>,

    /// Data directory, overrides `store.data_dir`
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Store identifier, overrides `store.store_id`
    #[arg(long)]
    pub store_id: Option<String>,

    /// Log filter (e.g. `debug`, `strand_store=trace`); `RUST_LOG` applies
    /// when omitted
    #[arg(long)]
    pub log_level: Option<String>,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    pub print_config: bool,
}

impl Cli {
    /// File, then `STRAND_*` variables, then flags; validated
    pub fn load_config<I>(&self, env: I) -> Result<StrandConfig>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut config = match &self.config {
            Some(path) => StrandConfig::load_from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => StrandConfig::default(),
        };
        config.merge_env_from(env)?;
        if let Some(bind) = &self.bind {
            config.rpc.bind = bind.clone();
        }
        if let Some(dir) = &self.data_dir {
            config.store.data_dir = dir.clone();
        }
        if let Some(id) = &self.store_id {
            config.store.store_id = id.clone();
        }
        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_flags_override_file_and_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strand.toml");
        std::fs::write(
            &path,
            "[store]\nstore_id = \"from-file\"\ntimeline_max_size = 50\n\n[rpc]\nbind = \"0.0.0.0:1\"\n",
        )
        .unwrap();

        let cli = Cli::try_parse_from([
            "strand-node",
            "--config",
            path.to_str().unwrap(),
            "--store-id",
            "from-flag",
        ])
        .unwrap();
        let config = cli
            .load_config(vars(&[("STRAND_RPC_BIND", "127.0.0.1:9000")]))
            .unwrap();
        assert_eq!(config.store.store_id, "from-flag");
        assert_eq!(config.store.timeline_max_size, 50);
        assert_eq!(config.rpc.bind, "127.0.0.1:9000");
    }

    #[test]
    fn test_invalid_config_is_refused() {
        let cli = Cli::try_parse_from(["strand-node", "--store-id", ""]).unwrap();
        assert!(cli.load_config(Vec::new()).is_err());

        let cli = Cli::try_parse_from(["strand-node"]).unwrap();
        let err = cli
            .load_config(vars(&[("STRAND_STORE_MAX_CAPACITY", "lots")]))
            .unwrap_err();
        assert!(err.to_string().contains("STRAND_STORE_MAX_CAPACITY"));
    }
}
