//! ---
//! xlab_section: "01-core-functionality"
//! xlab_subsection: "module"
//! xlab_type: "source"
//! xlab_scope: "code"
//! xlab_description: "Command codes and inbound command routing."
//! xlab_version: "v0.0.0-prealpha"
//! xlab_owner: "tbd"
//! ---
use serde_json::Value;
use strum::{AsRefStr, Display};
use tracing::{debug, info, warn};

use crate::collaborators::ContainerRole;
use crate::controller::ExperimentController;
use crate::error::{ControllerError, Result};

/// Command codes understood on the command bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr)]
#[repr(u8)]
pub enum CommandCode {
    SystemReady = 1,
    BenchmarkReady = 2,
    BenchmarkFinished = 11,
    TaskGenerationFinished = 15,
    ContainerTerminated = 16,
    StartBenchmark = 17,
}

impl CommandCode {
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for CommandCode {
    type Error = ControllerError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(CommandCode::SystemReady),
            2 => Ok(CommandCode::BenchmarkReady),
            11 => Ok(CommandCode::BenchmarkFinished),
            15 => Ok(CommandCode::TaskGenerationFinished),
            16 => Ok(CommandCode::ContainerTerminated),
            17 => Ok(CommandCode::StartBenchmark),
            other => Err(ControllerError::UnknownCommand(other)),
        }
    }
}

/// Encode a container-terminated notice: length-prefixed name, then exit code.
pub fn encode_container_terminated(container_name: &str, exit_code: i32) -> Vec<u8> {
    let name = container_name.as_bytes();
    let mut payload = Vec::with_capacity(4 + name.len() + 1);
    payload.extend_from_slice(&(name.len() as u32).to_be_bytes());
    payload.extend_from_slice(name);
    payload.push((exit_code & 0xff) as u8);
    payload
}

fn decode_container_terminated(payload: &[u8]) -> Result<(String, u8)> {
    let malformed = |reason: &str| ControllerError::MalformedPayload(reason.to_owned());
    let (len, rest) = payload
        .split_first_chunk::<4>()
        .ok_or_else(|| malformed("container-terminated payload shorter than its length prefix"))?;
    let len = u32::from_be_bytes(*len) as usize;
    if rest.len() != len + 1 {
        return Err(malformed("container-terminated payload length mismatch"));
    }
    let name = std::str::from_utf8(&rest[..len])
        .map_err(|_| malformed("container name is not valid UTF-8"))?;
    Ok((name.to_owned(), rest[len]))
}

/// Inbound command delivered by the bus.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundCommand {
    BenchmarkReady,
    SystemReady,
    TaskGenerationFinished,
    /// Raw result payload; empty when the benchmark sent none.
    BenchmarkFinished(Vec<u8>),
    ContainerTerminated { name: String, exit_code: u8 },
}

impl InboundCommand {
    pub fn decode(code: u8, payload: &[u8]) -> Result<Self> {
        match CommandCode::try_from(code)? {
            CommandCode::BenchmarkReady => Ok(InboundCommand::BenchmarkReady),
            CommandCode::SystemReady => Ok(InboundCommand::SystemReady),
            CommandCode::TaskGenerationFinished => Ok(InboundCommand::TaskGenerationFinished),
            CommandCode::BenchmarkFinished => {
                Ok(InboundCommand::BenchmarkFinished(payload.to_vec()))
            }
            CommandCode::ContainerTerminated => {
                let (name, exit_code) = decode_container_terminated(payload)?;
                Ok(InboundCommand::ContainerTerminated { name, exit_code })
            }
            CommandCode::StartBenchmark => Err(ControllerError::UnknownCommand(code)),
        }
    }
}

/// Routes inbound commands into the controller.
#[derive(Clone)]
pub struct CommandDispatcher {
    controller: ExperimentController,
}

impl CommandDispatcher {
    pub fn new(controller: ExperimentController) -> Self {
        Self { controller }
    }

    /// Decode and dispatch a raw bus message.
    pub async fn dispatch_raw(&self, code: u8, payload: &[u8]) -> Result<()> {
        let command = InboundCommand::decode(code, payload)?;
        self.dispatch(command).await
    }

    pub async fn dispatch(&self, command: InboundCommand) -> Result<()> {
        match command {
            InboundCommand::BenchmarkReady => {
                self.controller.report_ready(ContainerRole::Benchmark).await;
            }
            InboundCommand::SystemReady => {
                self.controller.report_ready(ContainerRole::System).await;
            }
            InboundCommand::TaskGenerationFinished => {
                self.controller.report_task_generation_done().await;
            }
            InboundCommand::BenchmarkFinished(payload) => {
                if payload.is_empty() {
                    warn!("received benchmark-finished without a result payload");
                    return Ok(());
                }
                let result: Value = serde_json::from_slice(&payload)
                    .map_err(|err| ControllerError::MalformedPayload(err.to_string()))?;
                self.controller.report_benchmark_finished(result).await;
            }
            InboundCommand::ContainerTerminated { name, exit_code } => {
                // Notices are produced by this controller for the containers it
                // does not own; they never drive the slot.
                info!(container = %name, exit_code, "container terminated notice");
            }
        }
        debug!("inbound command dispatched");
        Ok(())
    }
}
