use clap::Parser;

use std::path::PathBuf;

use hopbridge_lib::config;

/// Multi-hop personal VPN gateway node
#[derive(Clone, Debug, Parser)]
#[command(version)]
pub struct Cli {
    /// Node configuration file
    #[arg(
        short,
        long,
        env = config::ENV_VAR,
        default_value = config::DEFAULT_PATH,
    )]
    pub config_path: PathBuf,
}

pub fn parse() -> Cli {
    Cli::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_cli_with_config_override() -> anyhow::Result<()> {
        let args = Cli::try_parse_from(["hopbridge", "--config-path", "/tmp/hopbridge.toml"])?;
        assert_eq!(args.config_path, PathBuf::from("/tmp/hopbridge.toml"));

        Ok(())
    }

    #[test]
    fn falls_back_to_default_config_path() -> anyhow::Result<()> {
        let args = Cli::try_parse_from(["hopbridge"])?;
        assert_eq!(args.config_path, PathBuf::from(config::DEFAULT_PATH));

        Ok(())
    }
}
