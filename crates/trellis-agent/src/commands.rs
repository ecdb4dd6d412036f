// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Command execution seam.
//!
//! Everything that touches kernel state goes through [`CommandRunner`],
//! so the reconcilers can be exercised against a recording fake without a
//! WireGuard-capable kernel.

use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::error::{AgentError, Result};

#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
	pub stdout: String,
	pub stderr: String,
	pub success: bool,
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
	/// Run a command, optionally feeding `stdin`.
	async fn run(&self, program: &str, args: &[&str], stdin: Option<&str>)
		-> Result<CommandOutput>;

	/// Run and fail on a non-zero exit.
	async fn run_checked(&self, program: &str, args: &[&str], stdin: Option<&str>) -> Result<String> {
		let output = self.run(program, args, stdin).await?;
		if !output.success {
			return Err(AgentError::Command {
				command: format!("{program} {}", args.join(" ")),
				stderr: output.stderr,
			});
		}
		Ok(output.stdout)
	}
}

/// Real command execution via the OS.
#[derive(Debug, Clone, Default)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
	async fn run(
		&self,
		program: &str,
		args: &[&str],
		stdin: Option<&str>,
	) -> Result<CommandOutput> {
		debug!(program, ?args, "exec");

		let mut command = Command::new(program);
		command
			.args(args)
			.stdout(Stdio::piped())
			.stderr(Stdio::piped());
		command.stdin(if stdin.is_some() {
			Stdio::piped()
		} else {
			Stdio::null()
		});

		let mut child = command.spawn()?;
		if let Some(input) = stdin {
			if let Some(mut handle) = child.stdin.take() {
				handle.write_all(input.as_bytes()).await?;
			}
		}

		let output = child.wait_with_output().await?;
		Ok(CommandOutput {
			stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
			stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
			success: output.status.success(),
		})
	}
}
