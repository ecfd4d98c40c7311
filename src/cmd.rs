use std::io::Write;
use std::process::{Command, Output, Stdio};

use tracing::debug;

use crate::error::{DeployError, DeployResult};

/// Run a command and capture its trimmed stdout. A non-zero exit
/// becomes [`DeployError::CommandFailed`] carrying stderr verbatim.
pub fn run(program: &str, args: &[&str]) -> DeployResult<String> {
    debug!(command = %format_command(program, args), "exec");
    let output = spawn(Command::new(program).args(args), program)?;
    into_stdout(program, args, &output)
}

/// Run a command that reads `stdin_data` on its standard input.
///
/// Used for anything secret: private keys and API payloads never
/// appear on a command line.
pub fn run_with_stdin(program: &str, args: &[&str], stdin_data: &[u8]) -> DeployResult<String> {
    debug!(command = %format_command(program, args), "exec (stdin)");

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| not_found_or_io(program, e))?;

    if let Some(stdin) = &mut child.stdin {
        stdin.write_all(stdin_data)?;
    }
    drop(child.stdin.take());

    let output = child.wait_with_output()?;
    into_stdout(program, args, &output)
}

/// Run a shell pipeline (via `bash -o pipefail -c`) so a failure in
/// any stage of the pipe fails the whole command.
pub fn run_pipeline(shell_cmd: &str) -> DeployResult<()> {
    run("bash", &["-o", "pipefail", "-c", shell_cmd]).map(|_| ())
}

/// Check if a command exists on PATH.
#[must_use]
pub fn command_exists(program: &str) -> bool {
    Command::new("which")
        .arg(program)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok_and(|s| s.success())
}

fn spawn(command: &mut Command, program: &str) -> DeployResult<Output> {
    command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .map_err(|e| not_found_or_io(program, e))
}

fn into_stdout(program: &str, args: &[&str], output: &Output) -> DeployResult<String> {
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        Err(DeployError::CommandFailed {
            command: format_command(program, args),
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

fn not_found_or_io(program: &str, e: std::io::Error) -> DeployError {
    if e.kind() == std::io::ErrorKind::NotFound {
        DeployError::CommandNotFound(program.to_string())
    } else {
        DeployError::Io(e)
    }
}

/// Render a command for logs and error messages.
#[must_use]
pub fn format_command(program: &str, args: &[&str]) -> String {
    let mut parts = vec![program.to_string()];
    parts.extend(args.iter().map(|a| (*a).to_string()));
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_command_line() {
        assert_eq!(
            format_command("docker", &["ps", "-a"]),
            "docker ps -a"
        );
    }

    #[test]
    fn missing_program_is_command_not_found() {
        let err = run("definitely-not-a-real-binary-xyz", &[]).unwrap_err();
        assert!(matches!(err, DeployError::CommandNotFound(_)));
    }
}
