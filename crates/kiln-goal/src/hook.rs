//! Wire format for the external build hook (remote-build dispatch).
//!
//! The hook is a long-lived child process started once per worker; each
//! candidate build is offered to it with a single line and it answers with
//! `accept`, `decline`, or `postpone`. Our builder runs synchronously rather
//! than as a multiplexed child, so unlike the fd-4/log-pipe protocol this
//! offers one negotiation per call and blocks on the hook's reply — there is
//! no concurrent local build to interleave with while a remote one runs.

use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use kiln_derive::StorePath;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HookError {
    #[error("I/O error talking to build hook: {0}")]
    Io(#[from] std::io::Error),
    #[error("build hook malfunctioned: {0}")]
    Malfunction(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookDecision {
    Accept,
    Decline,
    Postpone,
}

/// A hook process kept alive across offers for the life of one worker run.
pub struct BuildHook {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl BuildHook {
    pub fn spawn(command: &str) -> Result<Self, HookError> {
        let mut child = Command::new(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;
        let stdin = child.stdin.take().expect("piped stdin");
        let stdout = BufReader::new(child.stdout.take().expect("piped stdout"));
        Ok(Self { child, stdin, stdout })
    }

    /// Offer one build. `can_run_locally` is false when every local slot is
    /// busy, matching the parent-writes-first half of the wire protocol.
    pub fn offer(
        &mut self,
        can_run_locally: bool,
        platform: &str,
        drv_path: &StorePath,
        features: &[String],
    ) -> Result<HookDecision, HookError> {
        writeln!(
            self.stdin,
            "{} {} {} {}",
            can_run_locally as u8,
            platform,
            drv_path.display_name(),
            features.join(","),
        )?;
        self.stdin.flush()?;

        loop {
            let mut line = String::new();
            let n = self.stdout.read_line(&mut line)?;
            if n == 0 {
                return Err(HookError::Malfunction("hook closed stdout without a decision".into()));
            }
            let line = line.trim_end();
            match line {
                "# accept" => return Ok(HookDecision::Accept),
                "# decline" => return Ok(HookDecision::Decline),
                "# postpone" => return Ok(HookDecision::Postpone),
                other if other.starts_with("# ") => {
                    return Err(HookError::Malfunction(format!("unrecognised control line: {other}")));
                }
                other => log::debug!("build hook: {other}"),
            }
        }
    }

    /// After an accept, hand over the input closure and expected output
    /// paths, then close stdin so the hook knows the handoff is complete.
    pub fn send_job(&mut self, inputs: &[StorePath], outputs: &[StorePath]) -> Result<(), HookError> {
        let input_line: String =
            inputs.iter().map(|p| p.display_name()).collect::<Vec<_>>().join(" ");
        let output_line: String =
            outputs.iter().map(|p| p.display_name()).collect::<Vec<_>>().join(" ");
        writeln!(self.stdin, "{input_line}")?;
        writeln!(self.stdin, "{output_line}")?;
        self.stdin.flush()?;
        Ok(())
    }

    /// Wait for the remote build to finish. Exit code 100 is a build
    /// failure, not a hook malfunction.
    pub fn wait(mut self) -> Result<(), HookError> {
        drop(self.stdin);
        let status = self.child.wait()?;
        match status.code() {
            Some(0) => Ok(()),
            Some(100) => Err(HookError::Malfunction("remote build failed".into())),
            other => Err(HookError::Malfunction(format!("hook exited with {other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offer_line_format() {
        let hash = kiln_derive::Hash::of_str("hook-test");
        let path = StorePath::new(hash, "foo.drv".to_string());
        // Exercise the formatting logic without a real child process.
        let line = format!(
            "{} {} {} {}",
            1u8,
            "x86_64-linux",
            path.display_name(),
            ["kvm".to_string()].join(","),
        );
        assert!(line.starts_with("1 x86_64-linux "));
        assert!(line.ends_with("kvm"));
    }
}
