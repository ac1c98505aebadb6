// Check command: run the injection validator without spawning anything

use anyhow::{bail, Result};
use serde::Serialize;

use crate::output::{print_field, OutputFormat};

#[derive(Debug, Serialize)]
struct CheckResult<'a> {
    command: &'a str,
    args: &'a [String],
    accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

pub fn run(command: &str, args: &[String], output: OutputFormat) -> Result<()> {
    let verdict = stagehand_exec::validate(command, args);
    let result = CheckResult {
        command,
        args,
        accepted: verdict.is_ok(),
        reason: verdict.as_ref().err().map(|e| e.to_string()),
    };

    if output.is_text() {
        print_field("Command", command);
        print_field("Arguments", &format!("{:?}", args));
        match &result.reason {
            None => print_field("Result", "accepted"),
            Some(reason) => print_field("Result", &format!("rejected ({})", reason)),
        }
    } else {
        output.print_value(&result)?;
    }

    if let Err(e) = verdict {
        tracing::debug!(%command, error = %e, "Invocation rejected");
        bail!("invocation rejected: {}", e);
    }
    Ok(())
}
