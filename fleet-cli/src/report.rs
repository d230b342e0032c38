//! Terminal rendering of job events.

use std::collections::HashSet;
use std::time::Duration;

use color_eyre::eyre::Result;
use fleet::job::{FleetJob, TargetResult, TargetState};

pub struct Report {
    json: bool,
    printed: HashSet<usize>,
}

impl Report {
    pub fn new(json: bool) -> Self {
        Self {
            json,
            printed: HashSet::new(),
        }
    }

    pub fn started(&self, job: &FleetJob) {
        if self.json {
            return;
        }
        println!("* {} (job {})", job.title(), job.id());
        println!("* targets: {}", job.targets().len());
    }

    /// Print every result that turned terminal since the last call.
    pub fn progress(&mut self, job: &FleetJob, done: usize, total: usize) {
        for result in job.results() {
            if !result.is_terminal() || !self.printed.insert(*result.target_index()) {
                continue;
            }
            if !self.json {
                println!("[{}/{}] {}", done, total, line(result));
            }
        }
    }

    pub fn finished(&self, job: &FleetJob) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(job)?);
            return Ok(());
        }

        println!();
        println!("*** results: {} ***", job.title());
        for result in job.results() {
            println!("* {}", line(result));
            let body = match result.state() {
                TargetState::Ok => result.stdout().trim_end(),
                _ => result.stderr().trim_end(),
            };
            for output in body.lines() {
                println!("    | {}", output);
            }
        }
        let summary = job.summary();
        println!(
            "* {} ok, {} failed, {} canceled ({} total)",
            summary.ok, summary.failed, summary.canceled, summary.total
        );
        Ok(())
    }
}

fn line(result: &TargetResult) -> String {
    let mut line = format!(
        "{} ({}@{}:{}): {}",
        result.name(),
        result.user(),
        result.host(),
        result.port(),
        result.state().to_string().to_uppercase(),
    );
    if *result.state() != TargetState::Canceled {
        line.push_str(&format!(" {}", format_duration(*result.duration())));
    }
    if let Some(error) = result.error() {
        line.push_str(&format!(" - {}", error));
    }
    line
}

fn format_duration(duration: Duration) -> String {
    if duration < Duration::from_secs(1) {
        format!("{}ms", duration.as_millis())
    } else {
        format!("{:.1}s", duration.as_secs_f64())
    }
}
