//! Helpers for running the external capture and decode tools

use std::process::Output;

use tokio::process::Command;
use tracing::trace;

/// Substitute `{name}` placeholders in an argument template
pub fn render_args(template: &[String], vars: &[(&str, &str)]) -> Vec<String> {
    template
        .iter()
        .map(|arg| {
            vars.iter().fold(arg.clone(), |acc, (name, value)| {
                acc.replace(&format!("{{{}}}", name), value)
            })
        })
        .collect()
}

/// Run `args[0]` with the remaining arguments and collect its output
///
/// The child is killed if the returned future is dropped before it completes.
pub async fn run(args: &[String]) -> std::io::Result<Output> {
    let (program, rest) = args.split_first().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command")
    })?;

    trace!(program = %program, args = ?rest, "Running external tool");
    Command::new(program)
        .args(rest)
        .kill_on_drop(true)
        .output()
        .await
}
