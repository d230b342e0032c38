use async_trait::async_trait;
use color_eyre::eyre::Result;

use super::Interactive;
use crate::inventory::Inventory;

pub struct TargetsCommand;

#[async_trait]
impl<'a> super::Command<'a> for TargetsCommand {
    fn new() -> Self
    where
        Self: Sized,
    {
        Self
    }

    async fn run(&self, context: &'a super::CliContext) -> Result<()> {
        let path = self.read_argument_with_validator(context.matches, "inventory", &mut |_| Ok(()))?;
        let inventory = Inventory::read(path).await?;
        let groups = self.read_many(context.matches, "group");
        let selection = inventory.select(&groups, &[])?;

        println!("*** targets ({}) ***", selection.len());
        for index in selection {
            let target = &inventory.targets()[index];
            println!(
                "[{}] {} ({}): {} ({})",
                index,
                target.name(),
                target.group(),
                target,
                target.transport()
            );
        }
        Ok(())
    }
}

impl<'a> super::Interactive<'a> for TargetsCommand {}
