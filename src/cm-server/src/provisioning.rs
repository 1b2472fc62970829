//! Runs the optional provisioning/disk-encryption command lines from
//! config (spec.md §6), the way `iamserver.cpp`'s `OnStartProvisioning`/
//! `OnFinishProvisioning`/disk-encryption setup shell out to
//! `ExecCommand` rather than linking the tooling in-process.

use std::process::Command;

use cm_ore::error::CmError;
use tracing::info;

pub fn run_command(command_line: &str) -> Result<(), CmError> {
    info!(command = command_line, "running provisioning command");
    let status = Command::new("sh").arg("-c").arg(command_line).status().map_err(|e| CmError::internal(format!("spawning `{command_line}`: {e}")))?;
    if !status.success() {
        return Err(CmError::internal(format!("`{command_line}` exited with {status}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn a_successful_command_returns_ok() {
        run_command("true").unwrap();
    }

    #[test]
    fn a_failing_command_is_an_internal_error() {
        let err = run_command("false").unwrap_err();
        assert_eq!(err.kind(), cm_ore::ErrorKind::Internal);
    }
}
