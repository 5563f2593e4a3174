mod doctor;
mod serve;

use anyhow::Result;
use console::style;
use std::path::PathBuf;

use crate::core::terminal::{self, GuideSection, print_error};
use serve::ServeOptions;

fn print_help() {
    terminal::print_banner();

    GuideSection::new("Daemon")
        .command("serve", "Run the API server and schedule engine (default)")
        .print();

    GuideSection::new("Serve options")
        .command("--host <addr>", "Bind address (overrides [api] host)")
        .command("--port <port>", "Bind port (overrides [api] port)")
        .command("--config <path>", "Config file (default: <data dir>/config.toml)")
        .command("--quiet", "Log to the /api/logs stream only")
        .print();

    GuideSection::new("Diagnostics")
        .command("doctor", "Check ssh, sshpass, data dir and config")
        .command("help", "Show this help")
        .print();

    println!(
        "\n {} {} <command> [options]\n {} data dir is $VPSORCH_HOME or ~/.vpsorch\n",
        style("Usage:").bold(),
        style("vpsorch").green(),
        style("Note:").bold()
    );
}

/// Parses `serve` flags starting at `start`. A flag missing its value is
/// an error rather than silently ignored.
pub(crate) fn parse_serve_flags(args: &[String], start: usize) -> Result<ServeOptions> {
    let mut opts = ServeOptions::default();
    let mut i = start;
    while i < args.len() {
        let value = || {
            args.get(i + 1)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("{} requires a value", args[i]))
        };
        match args[i].as_str() {
            "--host" => {
                opts.host = Some(value()?);
                i += 2;
            }
            "--port" => {
                let raw = value()?;
                opts.port = Some(
                    raw.parse()
                        .map_err(|_| anyhow::anyhow!("invalid --port '{}'", raw))?,
                );
                i += 2;
            }
            "--config" => {
                opts.config = Some(PathBuf::from(value()?));
                i += 2;
            }
            "--quiet" | "-q" => {
                opts.quiet = true;
                i += 1;
            }
            other => anyhow::bail!("unknown option '{}'", other),
        }
    }
    Ok(opts)
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let cmd = args.get(1).map(String::as_str).unwrap_or("serve");

    match cmd {
        "serve" => serve::run_serve(parse_serve_flags(&args, 2)?).await,
        // bare flags mean `serve`
        flag if flag.starts_with("--") => serve::run_serve(parse_serve_flags(&args, 1)?).await,
        "doctor" => {
            let config = args
                .iter()
                .position(|a| a == "--config")
                .and_then(|i| args.get(i + 1))
                .map(PathBuf::from);
            doctor::run_doctor(config.as_deref()).await?;
            Ok(())
        }
        "help" | "-h" => {
            print_help();
            Ok(())
        }
        other => {
            print_error(&format!("Unknown command '{}'", other));
            print_help();
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn serve_flags_are_parsed() {
        let parsed = parse_serve_flags(
            &args(&["vpsorch", "serve", "--host", "0.0.0.0", "--port", "9000", "-q"]),
            2,
        )
        .unwrap();
        assert_eq!(parsed.host.as_deref(), Some("0.0.0.0"));
        assert_eq!(parsed.port, Some(9000));
        assert!(parsed.quiet);
        assert_eq!(parsed.config, None);
    }

    #[test]
    fn config_path_is_taken_verbatim() {
        let parsed =
            parse_serve_flags(&args(&["vpsorch", "--config", "/etc/vpsorch.toml"]), 1).unwrap();
        assert_eq!(parsed.config, Some(PathBuf::from("/etc/vpsorch.toml")));
    }

    #[test]
    fn bad_flags_are_errors() {
        assert!(parse_serve_flags(&args(&["vpsorch", "serve", "--port", "http"]), 2).is_err());
        assert!(parse_serve_flags(&args(&["vpsorch", "serve", "--host"]), 2).is_err());
        assert!(parse_serve_flags(&args(&["vpsorch", "serve", "--verbose"]), 2).is_err());
    }
}
