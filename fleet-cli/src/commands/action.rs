use async_trait::async_trait;
use clap::ArgMatches;
use color_eyre::eyre::{eyre, Result};
use fleet::executor::{FleetConnector, RemoteTargetExecutor};
use fleet::log::*;
use fleet::orchestrator::{self, JobEvent, Orchestrator};
use fleet::FleetAction;
use regex::Regex;

use super::{CommandErrors, Interactive};
use crate::inventory::Inventory;
use crate::report::Report;

const SERVICE_NAME: &str = r"^[A-Za-z0-9@._:-]+$";

/// Runs one fleet action (`run`, `check-service`, `restart-service`) against
/// the selected targets.
pub struct ActionCommand;

impl ActionCommand {
    fn action(&self, subcommand: &str, matches: &ArgMatches) -> Result<FleetAction> {
        match subcommand {
            "run" => {
                let command = self.read_many(matches, "command").join(" ");
                Ok(FleetAction::run_command(command))
            }
            "check-service" | "restart-service" => {
                let regex = Regex::new(SERVICE_NAME)?;
                let service = self.read_argument_with_regex_validation(matches, "service", &regex)?;
                if subcommand == "check-service" {
                    Ok(FleetAction::check_service(service))
                } else {
                    Ok(FleetAction::restart_service(service))
                }
            }
            other => Err(CommandErrors::InvalidSubcommand(other.to_string()).into()),
        }
    }

    fn dry_run(&self, inventory: &Inventory, selection: &[usize], action: &FleetAction) {
        println!("*** {} ***\n", action.title());
        for &index in selection {
            let target = &inventory.targets()[index];
            println!(
                "* {} ({}): {}",
                target.name(),
                target,
                action.remote_command()
            );
        }
    }
}

#[async_trait]
impl<'a> super::Command<'a> for ActionCommand {
    fn new() -> Self
    where
        Self: Sized,
    {
        Self
    }

    #[tracing::instrument(skip(self, context), fields(subcommand = context.subcommand))]
    async fn run(&self, context: &'a super::CliContext) -> Result<()> {
        let matches = context.matches;
        let action = self.action(context.subcommand, matches)?;

        let path = self.read_argument_with_validator(matches, "inventory", &mut |_| Ok(()))?;
        let inventory = Inventory::read(path).await?;
        let groups = self.read_many(matches, "group");
        let names = self.read_many(matches, "target");
        let selection = inventory.select(&groups, &names)?;

        if matches.get_flag("dry") {
            self.dry_run(&inventory, &selection, &action);
            return Ok(());
        }

        if let FleetAction::RestartService { service } = &action {
            let prompt = format!("Restart {} on {} targets?", service, selection.len());
            if !matches.get_flag("yes") && !self.confirm(&prompt)? {
                return Err(CommandErrors::Aborted.into());
            }
        }

        let (concurrency, timeout) = inventory.settings().resolve(
            matches.get_one::<usize>("concurrency").copied(),
            matches.get_one::<u64>("timeout").copied(),
        );

        let (tx, mut events) = orchestrator::events(1024);
        let mut orchestrator =
            Orchestrator::new(RemoteTargetExecutor::new(FleetConnector::default()), tx);
        orchestrator.set_max_concurrency(concurrency)?;
        orchestrator.set_command_timeout(timeout);
        debug!(
            "running with concurrency {} and timeout {:?}",
            orchestrator.max_concurrency(),
            orchestrator.command_timeout()
        );
        orchestrator.start(inventory.targets(), &selection, action)?;

        let mut report = Report::new(matches.get_flag("json"));
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);
        let mut cancel_requested = false;

        let job = loop {
            tokio::select! {
                event = events.next() => match event {
                    Some(JobEvent::Started(job)) => report.started(&job),
                    Some(JobEvent::Progress { job, done, total }) => report.progress(&job, done, total),
                    Some(JobEvent::Finished(job)) => break job,
                    None => return Err(eyre!("orchestrator stopped without finishing the job")),
                },
                _ = &mut ctrl_c, if !cancel_requested => {
                    eprintln!("* canceling; waiting for in-flight targets to finish...");
                    orchestrator.cancel();
                    cancel_requested = true;
                }
            }
        };

        report.finished(&job)?;
        let summary = job.summary();
        if summary.all_ok() {
            Ok(())
        } else {
            Err(CommandErrors::JobIncomplete(job.id().to_string(), summary.failed, summary.canceled).into())
        }
    }
}

impl<'a> super::Interactive<'a> for ActionCommand {}
