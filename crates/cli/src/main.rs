//! storepull: serve chunk and index pulls from HTTP
//!
//! Speaks the chunk protocol on stdin/stdout and answers everything the peer
//! asks for from an HTTP index URL and one or more HTTP chunk stores.

mod logging;

use clap::builder::BoolishValueParser;
use clap::builder::styling::{AnsiColor, Effects};
use clap::{Parser, Subcommand, builder::Styles};
use color_eyre::Result;

use storepull_core::RemoteEngine;
use storepull_transport::{Endpoints, PullOptions, ReqwestClient, pull};

const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .usage(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .literal(AnsiColor::Cyan.on_default().effects(Effects::BOLD))
    .placeholder(AnsiColor::Cyan.on_default())
    .valid(AnsiColor::Green.on_default())
    .invalid(AnsiColor::Red.on_default());

#[derive(Parser)]
#[command(name = "storepull")]
#[command(version)]
#[command(styles = STYLES)]
#[command(about = "HTTP helper for chunk store pulls")]
#[command(long_about = r#"
storepull is spawned by a chunk store client with the protocol channel on
stdin/stdout. It fetches the requested index and chunks over HTTP.

Use "-" for any endpoint that is not configured.

Chunks are looked up as <store>/<first 4 hex chars>/<chunk id>.xz

Examples:
  storepull pull - - http://host/image.caidx - http://host/default.castr
  storepull pull - - - http://primary/store http://mirror/store
"#)]
struct Cli {
    /// Enable verbose logging
    #[arg(
        short,
        long,
        global = true,
        env = "STOREPULL_VERBOSE",
        value_parser = BoolishValueParser::new()
    )]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Pull an index and chunks from HTTP into the protocol channel
    Pull {
        /// Base directory URL (not supported over HTTP)
        base: String,

        /// Archive URL (not supported over HTTP)
        archive: String,

        /// Index URL
        index: String,

        /// Primary store URL, asked first
        wstore: String,

        /// Additional read-only store URLs
        stores: Vec<String>,

        /// Rotate chunk requests across all configured stores
        #[arg(long)]
        round_robin: bool,
    },
}

fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    logging::init(cli.verbose);

    match cli.command {
        Commands::Pull {
            base,
            archive,
            index,
            wstore,
            stores,
            round_robin,
        } => {
            let endpoints = Endpoints::parse(&base, &archive, &index, &wstore, &stores)?;
            pull_command(&endpoints, PullOptions { round_robin })?;
        }
    }

    Ok(())
}

fn pull_command(endpoints: &Endpoints, options: PullOptions) -> Result<()> {
    let client = ReqwestClient::new()?;
    let mut engine = RemoteEngine::stdio()?;

    pull(&mut engine, &client, endpoints, options)?;
    Ok(())
}
