// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "lotus",
    version,
    about = "An autonomous LLM tool-calling agent for the terminal"
)]
pub struct Cli {
    /// Explicit config file, merged over the discovered config layers.
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Run a single request non-interactively and exit.
    #[arg(short = 'p', long = "prompt", value_name = "TEXT")]
    pub prompt: Option<String>,

    /// Increase log verbosity (-v debug, -vv trace).  Logs go to stderr.
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Print the merged configuration as YAML and exit.
    #[arg(long)]
    pub show_config: bool,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_one_shot_prompt() {
        let cli = Cli::parse_from(["lotus", "-p", "what is 2+2?"]);
        assert_eq!(cli.prompt.as_deref(), Some("what is 2+2?"));
        assert!(!cli.show_config);
    }

    #[test]
    fn parses_config_path_and_verbosity() {
        let cli = Cli::parse_from(["lotus", "--config", "/tmp/l.yaml", "-vv"]);
        assert_eq!(
            cli.config.as_deref(),
            Some(std::path::Path::new("/tmp/l.yaml"))
        );
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn defaults_to_interactive_mode() {
        let cli = Cli::parse_from(["lotus"]);
        assert!(cli.prompt.is_none());
    }
}
