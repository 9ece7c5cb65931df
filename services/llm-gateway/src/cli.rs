//! Command-line arguments

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about = "Send prompts through rotating LLM provider credentials", long_about = None)]
pub struct Cli {
    /// Config file (defaults to $LLM_GATEWAY_CONFIG, then ./llm-gateway.toml)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<String>,

    /// Print Prometheus metrics to stderr after the command
    #[arg(long, global = true)]
    pub metrics: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Send a prompt and print the completion
    Send {
        /// Provider to try first
        #[arg(long)]
        provider: Option<String>,

        #[arg(long)]
        model: Option<String>,

        /// Named task from the [tasks] table
        #[arg(long)]
        task: Option<String>,

        #[arg(long, value_name = "N")]
        max_retries: Option<u32>,

        /// Do not fail over to the fallback provider
        #[arg(long)]
        no_fallback: bool,

        #[arg(required = true, num_args = 1..)]
        prompt: Vec<String>,
    },
    /// Clear recorded quota exhaustion
    Reset { provider: Option<String> },
    /// Print pool status as JSON
    Status,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn parse(line: &str) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("llm-gateway").chain(line.split_whitespace()))
    }

    #[test]
    fn command_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_send_with_options() {
        let cli = parse(
            "--config gw.toml send --provider openrouter --task summarize --max-retries 1 --no-fallback summarize this",
        )
        .unwrap();
        assert_eq!(cli.config.as_deref(), Some("gw.toml"));
        assert!(!cli.metrics);
        assert_eq!(
            cli.command,
            Command::Send {
                provider: Some("openrouter".into()),
                model: None,
                task: Some("summarize".into()),
                max_retries: Some(1),
                no_fallback: true,
                prompt: vec!["summarize".into(), "this".into()],
            }
        );
    }

    #[test]
    fn global_flags_follow_the_subcommand() {
        let cli = parse("status --metrics --config other.toml").unwrap();
        assert!(cli.metrics);
        assert_eq!(cli.config.as_deref(), Some("other.toml"));
        assert_eq!(cli.command, Command::Status);
    }

    #[test]
    fn parses_reset() {
        assert_eq!(
            parse("reset google").unwrap().command,
            Command::Reset {
                provider: Some("google".into())
            }
        );
        assert_eq!(
            parse("reset").unwrap().command,
            Command::Reset { provider: None }
        );
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse("").is_err());
        assert!(parse("send").is_err());
        assert!(parse("send --max-retries lots hi").is_err());
        assert!(parse("--config").is_err());
        assert!(parse("launch").is_err());
    }
}
