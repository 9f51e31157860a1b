use clap::ArgMatches;
use colored::Colorize;
use commands::command_argument_builder;
use shelfsync::handlers::{
    handle_catalog, handle_crawl, handle_image_fetch, handle_image_warm, handle_init,
};
use shelfsync_core::{Settings, print_banner};
use std::path::PathBuf;
use tracing::Level;

mod commands;

pub const CLAP_STYLING: clap::builder::styling::Styles = clap::builder::styling::Styles::styled()
    .header(clap_cargo::style::HEADER)
    .usage(clap_cargo::style::USAGE)
    .literal(clap_cargo::style::LITERAL)
    .placeholder(clap_cargo::style::PLACEHOLDER)
    .error(clap_cargo::style::ERROR)
    .valid(clap_cargo::style::VALID)
    .invalid(clap_cargo::style::INVALID);

fn init_tracing(quiet: bool, verbosity: u8) {
    let level = match (quiet, verbosity) {
        (true, _) => Level::ERROR,
        (false, 0) => Level::WARN,
        (false, 1) => Level::INFO,
        (false, 2) => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_settings(matches: &ArgMatches) -> anyhow::Result<Settings> {
    let path = matches.get_one::<PathBuf>("config");
    Ok(Settings::load(path.map(PathBuf::as_path))?)
}

async fn dispatch(matches: &ArgMatches, quiet: bool) -> anyhow::Result<()> {
    match matches.subcommand() {
        Some(("init", primary_command)) => handle_init(primary_command),
        Some(("crawl", primary_command)) => {
            handle_crawl(primary_command, load_settings(matches)?, quiet).await
        }
        Some(("catalog", primary_command)) => {
            handle_catalog(primary_command, load_settings(matches)?).await
        }
        Some(("image", primary_command)) => match primary_command.subcommand() {
            Some(("fetch", secondary_command)) => {
                handle_image_fetch(secondary_command, load_settings(matches)?).await
            }
            Some(("warm", secondary_command)) => {
                handle_image_warm(secondary_command, load_settings(matches)?).await
            }
            _ => unreachable!("clap should ensure we don't get here"),
        },
        _ => unreachable!("clap should ensure we don't get here"),
    }
}

#[tokio::main]
async fn main() {
    let cmd = command_argument_builder();
    let chosen_command = cmd.get_matches();
    let quiet = chosen_command.get_flag("quiet");
    init_tracing(quiet, chosen_command.get_count("verbose"));

    // Show banner unless --quiet flag is set
    if !quiet {
        print_banner();
    }

    if chosen_command.subcommand().is_none() {
        return;
    }

    if let Err(e) = dispatch(&chosen_command, quiet).await {
        eprintln!("{} {:#}", "✗".red().bold(), e);
        std::process::exit(1);
    }
}
