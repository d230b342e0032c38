use async_trait::async_trait;
use clap::ArgMatches;
use color_eyre::eyre::{Result, WrapErr};
use dialoguer::Confirm;
use regex::Regex;
use thiserror::Error;

pub mod action;
pub mod targets;

#[derive(Error, Debug)]
pub enum CommandErrors {
    #[error("Prompt interaction failed.")]
    PromptInteractionFailed(
        #[from]
        #[source]
        dialoguer::Error,
    ),
    #[error("Required user input `{0}` is missing.")]
    RequiredUserInputMissing(String),
    #[error("Argument `{0}` failed validation `{1}`")]
    InputValidationFailure(String, String),
    #[error("Invalid subcommand `{0}`.")]
    InvalidSubcommand(String),
    #[error("Unknown target `{0}`.")]
    UnknownTarget(String),
    #[error("Unknown or empty group `{0}`.")]
    UnknownGroup(String),
    #[error("Duplicate target name `{0}` in inventory.")]
    DuplicateTargetName(String),
    #[error("Aborted by user.")]
    Aborted,
    #[error("Job {0} did not succeed everywhere: {1} failed, {2} canceled.")]
    JobIncomplete(String, usize, usize),
}

pub struct CliContext<'a> {
    pub subcommand: &'a str,
    pub matches: &'a ArgMatches,
}

impl<'a> CliContext<'a> {
    pub fn new(subcommand: &'a str, matches: &'a ArgMatches) -> Self {
        Self {
            subcommand,
            matches,
        }
    }
}

#[async_trait]
pub trait Command<'a> {
    fn new() -> Self
    where
        Self: Sized;

    async fn run(&self, context: &'a CliContext) -> Result<()>;
}

pub trait Interactive<'a> {
    fn confirm(&self, message: &str) -> Result<bool> {
        Confirm::new()
            .with_prompt(message)
            .default(false)
            .interact()
            .map_err(CommandErrors::PromptInteractionFailed)
            .wrap_err("Prompting for confirmation failed.")
    }

    /// Read argument from the CLI args with a validation function.
    fn read_argument_with_validator<V>(
        &self,
        arg_matches: &'a ArgMatches,
        id: &'a str,
        validator: &mut V,
    ) -> Result<String>
    where
        V: FnMut(&String) -> Result<(), CommandErrors>,
    {
        if let Some(arg) = arg_matches.get_one::<String>(id) {
            validator(arg)?;
            Ok(arg.clone())
        } else {
            Err(CommandErrors::RequiredUserInputMissing(id.into()))?
        }
    }

    /// Read argument from the CLI args with regex validation.
    fn read_argument_with_regex_validation(
        &self,
        arg_matches: &'a ArgMatches,
        id: &'a str,
        regex: &Regex,
    ) -> Result<String> {
        self.read_argument_with_validator(arg_matches, id, &mut |input| {
            if regex.is_match(input) {
                Ok(())
            } else {
                Err(CommandErrors::InputValidationFailure(
                    id.into(),
                    regex.as_str().into(),
                ))
            }
        })
    }

    /// Read a repeatable argument; absent means empty.
    fn read_many(&self, arg_matches: &'a ArgMatches, id: &'a str) -> Vec<String> {
        arg_matches
            .get_many::<String>(id)
            .map(|values| values.cloned().collect())
            .unwrap_or_default()
    }
}
