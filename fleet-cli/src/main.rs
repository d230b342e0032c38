#![forbid(unsafe_code)]

use clap::{command, value_parser, Arg, ArgAction};
use color_eyre::eyre::Result;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::util::SubscriberInitExt;

use crate::commands::Command;

mod commands;
mod inventory;
mod report;

use fleet::log::*;

/// Flags shared by every subcommand that runs an action.
fn with_selection_args(cmd: clap::Command) -> clap::Command {
    cmd.arg(
        Arg::new("inventory")
            .help("Path to the inventory file.")
            .short('i')
            .long("inventory")
            .required(true),
    )
    .arg(
        Arg::new("group")
            .help("Only run against targets in this group. Can be repeated.")
            .short('g')
            .long("group")
            .action(ArgAction::Append),
    )
    .arg(
        Arg::new("target")
            .help("Only run against the named target. Can be repeated.")
            .short('t')
            .long("target")
            .action(ArgAction::Append),
    )
    .arg(
        Arg::new("concurrency")
            .help("Maximum number of targets in flight. Overrides the inventory setting.")
            .short('c')
            .long("concurrency")
            .value_parser(value_parser!(usize)),
    )
    .arg(
        Arg::new("timeout")
            .help("Per-target timeout in seconds; 0 uses the default of 90. Overrides the inventory setting.")
            .long("timeout")
            .value_parser(value_parser!(u64)),
    )
    .arg(
        Arg::new("dry")
            .help("Don't actually run anything, just show what would run where.")
            .short('d')
            .long("dry")
            .action(ArgAction::SetTrue),
    )
    .arg(
        Arg::new("json")
            .help("Print the finished job as JSON instead of a table.")
            .long("json")
            .action(ArgAction::SetTrue),
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    install_color_eyre()?;

    // Command configuration
    let matches = command!()
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Turn debugging information on. Overrides -q. Can specify up to -vvvv.")
                .action(ArgAction::Count)
                .global(true),
        )
        .arg(
            Arg::new("quiet")
                .short('q')
                .long("quiet")
                .help("Silence all output. Overridden by -v.")
                .action(ArgAction::SetTrue)
                .global(true),
        )
        .subcommand(
            command!("targets")
                .about("List the targets in an inventory.")
                .arg(
                    Arg::new("inventory")
                        .help("Path to the inventory file.")
                        .short('i')
                        .long("inventory")
                        .required(true),
                )
                .arg(
                    Arg::new("group")
                        .help("Only list targets in this group. Can be repeated.")
                        .short('g')
                        .long("group")
                        .action(ArgAction::Append),
                ),
        )
        .subcommand(with_selection_args(
            command!("run").about("Run a shell command on every selected target.").arg(
                Arg::new("command")
                    .help("The command line to run.")
                    .required(true)
                    .num_args(1..)
                    .trailing_var_arg(true),
            ),
        ))
        .subcommand(with_selection_args(
            command!("check-service")
                .about("Check whether a service is active on every selected target.")
                .arg(Arg::new("service").help("Service name.").required(true)),
        ))
        .subcommand(with_selection_args(
            command!("restart-service")
                .about("Restart a service on every selected target.")
                .arg(Arg::new("service").help("Service name.").required(true))
                .arg(
                    Arg::new("yes")
                        .help("Don't ask for confirmation.")
                        .short('y')
                        .long("yes")
                        .action(ArgAction::SetTrue),
                ),
        ))
        .subcommand_required(true)
        .get_matches();

    // Set up logging
    let logging_config = tracing_subscriber::fmt::SubscriberBuilder::default()
        .with_timer(tracing_subscriber::fmt::time::UtcTime::new(
            time::macros::format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"),
        ))
        .with_span_events(tracing_subscriber::fmt::format::FmtSpan::NONE)
        .with_writer(std::io::stderr)
        .compact();

    let quiet = matches.get_flag("quiet");
    let verbose = matches.get_count("verbose") as usize;
    let logging_config = if quiet && verbose == 0 {
        logging_config.with_max_level(LevelFilter::ERROR)
    } else if verbose > 0 {
        let level = match verbose {
            1 => LevelFilter::WARN,
            2 => LevelFilter::INFO,
            3 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        };
        logging_config.with_max_level(level)
    } else {
        logging_config.with_max_level(LevelFilter::ERROR)
    };

    let subscriber = logging_config.finish();
    subscriber.init();

    // Run the commands
    if let Some((subcommand, matches)) = matches.subcommand() {
        let ctx = commands::CliContext::new(subcommand, matches);
        debug!(
            "matched subcommand {} with matches: {:?}",
            &subcommand,
            &matches.ids().map(|id| id.as_str()).collect::<Vec<_>>()
        );
        match subcommand {
            "targets" => commands::targets::TargetsCommand::new().run(&ctx).await?,
            "run" | "check-service" | "restart-service" => {
                commands::action::ActionCommand::new().run(&ctx).await?
            }
            _ => {
                return Err(commands::CommandErrors::InvalidSubcommand(subcommand.to_string()).into())
            }
        }
    }
    Ok(())
}
