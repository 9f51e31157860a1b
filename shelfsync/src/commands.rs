use crate::CLAP_STYLING;
use clap::{arg, command};
use url::Url;

fn kind_arg() -> clap::Arg {
    arg!(-k --"kind" <KIND>)
        .required(false)
        .help("Record kind to extract")
        .value_parser(["navigation", "category", "product"])
        .default_value("product")
}

pub(crate) fn command_argument_builder() -> clap::Command {
    clap::Command::new("shelfsync")
        .version(env!("CARGO_PKG_VERSION"))
        .bin_name("shelfsync")
        .styles(CLAP_STYLING)
        .arg(arg!(-q --"quiet" "Suppress banner and non-essential output").required(false))
        .arg(
            arg!(-v --"verbose" ... "Increase log verbosity (-v info, -vv debug, -vvv trace)")
                .required(false)
                .global(true),
        )
        .arg(
            arg!(-c --"config" <PATH>)
                .required(false)
                .global(true)
                .help("Settings file (default: ~/.config/shelfsync/config.json)")
                .value_parser(clap::value_parser!(std::path::PathBuf)),
        )
        .subcommand_required(false)
        .subcommand(
            command!("init")
                .about("Creates the shelfsync settings file and catalog database")
                .arg(
                    arg!([PATH])
                        .required(false)
                        .help("Directory to hold settings and the catalog")
                        .default_value("~/.config/shelfsync/"),
                )
                .arg(
                    arg!(-f - -"force")
                        .help("Overwrite any existing settings and catalog without asking")
                        .required(false),
                ),
        )
        .subcommand(
            command!("crawl")
                .about("Crawl a storefront, following pagination, and report the records found")
                .arg(
                    arg!(-u --"url" <URL>)
                        .required(false)
                        .help("The URL to crawl")
                        .value_parser(clap::value_parser!(Url))
                        .conflicts_with("hosts-file"),
                )
                .arg(
                    arg!(-H --"hosts-file" <PATH>)
                        .required(false)
                        .help("Path to a newline-delimited file of seed URLs")
                        .value_parser(clap::value_parser!(std::path::PathBuf))
                        .conflicts_with("url"),
                )
                .arg(kind_arg())
                .arg(
                    arg!(--"budget" <PAGES>)
                        .required(false)
                        .help("Maximum number of pages fetched in this session")
                        .value_parser(clap::value_parser!(usize)),
                )
                .arg(
                    arg!(--"concurrency" <NUM>)
                        .required(false)
                        .help("Maximum number of pages fetched at once")
                        .value_parser(clap::value_parser!(usize)),
                )
                .arg(
                    arg!(-o --"output" <PATH>)
                        .required(false)
                        .help("Save report to file (default: display to screen)")
                        .value_parser(clap::value_parser!(std::path::PathBuf)),
                )
                .arg(
                    arg!(-f --"format" <FORMAT>)
                        .required(false)
                        .help("Report format: text, json, csv, markdown")
                        .value_parser(["text", "json", "csv", "markdown"])
                        .default_value("text"),
                )
                .arg(
                    arg!(--"save")
                        .required(false)
                        .help("Upsert the records into the catalog")
                        .action(clap::ArgAction::SetTrue),
                ),
        )
        .subcommand(
            command!("catalog")
                .about("Read a record set from the catalog, refreshing it when stale")
                .arg(
                    arg!(-u --"url" <URL>)
                        .required(true)
                        .help("Root URL of the record set")
                        .value_parser(clap::value_parser!(Url)),
                )
                .arg(kind_arg())
                .arg(
                    arg!(--"wait")
                        .required(false)
                        .help("Wait for a scheduled background refresh before exiting")
                        .action(clap::ArgAction::SetTrue),
                )
                .arg(
                    arg!(--"history")
                        .required(false)
                        .help("List recent crawl sessions for this root")
                        .action(clap::ArgAction::SetTrue),
                ),
        )
        .subcommand(
            command!("image")
                .about("Fetch external images through the validating proxy cache")
                .subcommand_required(true)
                .subcommand(
                    command!("fetch")
                        .about("Fetch one image")
                        .arg(arg!(<URL>).help("Image URL, or a proxy URL wrapping one"))
                        .arg(
                            arg!(-o --"output" <PATH>)
                                .required(false)
                                .help("Write the image bytes to this file")
                                .value_parser(clap::value_parser!(std::path::PathBuf)),
                        ),
                )
                .subcommand(
                    command!("warm")
                        .about("Pre-fetch a list of images into the cache")
                        .arg(
                            arg!(-H --"hosts-file" <PATH>)
                                .required(true)
                                .help("Path to a newline-delimited file of image URLs")
                                .value_parser(clap::value_parser!(std::path::PathBuf)),
                        ),
                ),
        )
}
