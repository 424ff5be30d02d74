use std::collections::BTreeMap;
use std::time::Duration;

use crate::crd::task::ValidationSpec;
use crate::engine::validation;
use crate::executors::{ExecutionOutcome, truncate_output};

/// Run a command line. The input is split into argv on whitespace; quoting
/// is not interpreted. Stdout and stderr are captured and combined, and the
/// attempt succeeds iff the process exits with code 0 and validation passes.
pub async fn run(
    input: &str,
    env: &BTreeMap<String, String>,
    deadline: Duration,
    validation: Option<&ValidationSpec>,
) -> ExecutionOutcome {
    let mut argv = input.split_whitespace();
    let Some(program) = argv.next() else {
        return ExecutionOutcome::failure(String::new(), "no executable in input");
    };
    let args: Vec<&str> = argv.collect();

    let mut command = tokio::process::Command::new(program);
    command.args(&args);
    for (key, value) in env {
        command.env(key, value);
    }

    // Give the child its own process group; a timed-out command may have
    // forked helpers that must die with it
    #[cfg(unix)]
    {
        unsafe {
            command.pre_exec(|| {
                libc::setpgid(0, 0);
                Ok(())
            });
        }
    }

    command
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped());

    let child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            return ExecutionOutcome::failure(
                String::new(),
                format!("failed to start '{}': {}", program, e),
            );
        }
    };

    #[cfg(unix)]
    let child_pid = child.id();

    // Drain stdout and stderr while waiting for exit; a chatty child would
    // otherwise wedge against a full pipe buffer.
    let result = tokio::time::timeout(deadline, child.wait_with_output()).await;

    let output = match result {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return ExecutionOutcome::failure(
                String::new(),
                format!("failed to execute '{}': {}", program, e),
            );
        }
        Err(_) => {
            // Out of time: SIGKILL the group, then reap so nothing is left
            // as a zombie
            #[cfg(unix)]
            if let Some(pid) = child_pid {
                // kill(2) with a negated pid addresses every group member
                unsafe {
                    libc::kill(-(pid as i32), libc::SIGKILL);
                }
                loop {
                    let ret = unsafe {
                        libc::waitpid(-(pid as i32), std::ptr::null_mut(), libc::WNOHANG)
                    };
                    if ret <= 0 {
                        break;
                    }
                }
            }
            return ExecutionOutcome::failure(String::new(), "deadline exceeded");
        }
    };

    let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    let combined = truncate_output(&combined);

    if !output.status.success() {
        let code = output.status.code().unwrap_or(-1);
        return ExecutionOutcome::failure(combined, format!("exit status {}", code));
    }

    if let Some(spec) = validation
        && let Err(reason) = validation::validate_command(&combined, spec)
    {
        return ExecutionOutcome::failure(combined, format!("validation failed: {}", reason));
    }

    ExecutionOutcome::success(combined)
}
