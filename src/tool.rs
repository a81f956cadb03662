//! External command execution shared by the CLI-backed collaborators.
//!
//! The template compiler, stylesheet compiler, and bundler are third-party
//! programs. This module turns a configured `command = ["npx", "pug"]` list
//! into a [`Command`], runs it to completion, forwards its stderr to
//! `tracing`, and maps failure into [`ToolError`].

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("empty command line")]
    EmptyCommand,
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} failed ({status}): {message}")]
    Failed {
        program: String,
        status: String,
        message: String,
    },
    #[error("cannot read {}: {source}", .path.display())]
    Input {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} wrote invalid UTF-8 to stdout")]
    InvalidOutput { program: String },
}

/// Build a [`Command`] from a configured program + leading-arguments list.
pub fn command(parts: &[String], cwd: &Path) -> Result<Command, ToolError> {
    let (program, args) = parts.split_first().ok_or(ToolError::EmptyCommand)?;
    let mut cmd = Command::new(program);
    cmd.args(args).current_dir(cwd);
    Ok(cmd)
}

/// Run `cmd` to completion, optionally feeding `stdin`, and return stdout.
///
/// Each stderr line is logged at debug level under the `tool_output` target.
/// A non-zero exit becomes [`ToolError::Failed`] whose message is the last
/// non-empty stderr line (compilers print the useful part last).
pub fn run(cmd: &mut Command, stdin: Option<&[u8]>) -> Result<Vec<u8>, ToolError> {
    let program = cmd.get_program().to_string_lossy().to_string();
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });

    tracing::debug!("Running command: {:?}", cmd);

    let mut child = cmd.spawn().map_err(|source| ToolError::Spawn {
        program: program.clone(),
        source,
    })?;

    let output = std::thread::scope(|s| {
        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            s.spawn(move || {
                // A compiler that exits early closes the pipe; the exit status reports why.
                let _ = pipe.write_all(input);
            });
        }
        child.wait_with_output()
    })
    .map_err(|source| ToolError::Spawn {
        program: program.clone(),
        source,
    })?;

    let stderr = String::from_utf8_lossy(&output.stderr);
    for line in stderr.lines().filter(|l| !l.trim().is_empty()) {
        tracing::debug!(target: "tool_output", tool = %program, "{}", line);
    }

    if !output.status.success() {
        let message = stderr
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("no error output")
            .trim()
            .to_string();
        return Err(ToolError::Failed {
            program,
            status: output.status.to_string(),
            message,
        });
    }

    Ok(output.stdout)
}

/// Like [`run`], decoding stdout as UTF-8.
pub fn run_to_string(cmd: &mut Command, stdin: Option<&[u8]>) -> Result<String, ToolError> {
    let program = cmd.get_program().to_string_lossy().to_string();
    let stdout = run(cmd, stdin)?;
    String::from_utf8(stdout).map_err(|_| ToolError::InvalidOutput { program })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_command_is_rejected() {
        let result = command(&[], Path::new("."));
        assert!(matches!(result, Err(ToolError::EmptyCommand)));
    }

    #[test]
    fn command_splits_program_and_args() {
        let cmd = command(&["npx".into(), "pug".into()], Path::new("/tmp")).unwrap();
        assert_eq!(cmd.get_program(), "npx");
        let args: Vec<_> = cmd.get_args().collect();
        assert_eq!(args, vec!["pug"]);
        assert_eq!(cmd.get_current_dir(), Some(Path::new("/tmp")));
    }

    #[test]
    fn missing_program_is_spawn_error() {
        let mut cmd = command(
            &["sitepipe-definitely-not-installed".into()],
            Path::new("."),
        )
        .unwrap();
        assert!(matches!(run(&mut cmd, None), Err(ToolError::Spawn { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn stdin_is_forwarded_and_stdout_returned() {
        let mut cmd = command(&["cat".into()], Path::new(".")).unwrap();
        let out = run_to_string(&mut cmd, Some(b"hello")).unwrap();
        assert_eq!(out, "hello");
    }

    #[cfg(unix)]
    #[test]
    fn non_zero_exit_reports_last_stderr_line() {
        let mut cmd = command(
            &[
                "sh".into(),
                "-c".into(),
                "echo first >&2; echo 'Error: broken' >&2; exit 3".into(),
            ],
            Path::new("."),
        )
        .unwrap();
        match run(&mut cmd, None) {
            Err(ToolError::Failed { message, .. }) => assert_eq!(message, "Error: broken"),
            other => panic!("expected failure, got {other:?}"),
        }
    }
}
