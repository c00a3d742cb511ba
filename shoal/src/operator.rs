//! Operator control surface.
//!
//! [`Operator`] executes [`OperatorCommand`]s against a [`ModuleManager`]
//! and can serve them as newline-delimited JSON over any async reader and
//! writer pair, one reply line per command line:
//!
//! ```text
//! {"command":"status"}
//! {"command":"run","module":"db","job":"vacuum","payload":{"table":"users"},"wait":true}
//! {"command":"inspect","job_id":"6f1c..."}
//! {"command":"lockdown"}
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::job::{JobId, JobRequest, JobResult};
use crate::manager::{JobInspection, ModuleManager};
use crate::module::ModuleReport;
use crate::statistics::JobStatistics;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum OperatorCommand {
    /// Force every module into lockdown.
    Lockdown,
    /// Status, queue depths and concurrency of every module.
    Status,
    /// Per-job statistics for one module, or all of them.
    Stats {
        #[serde(default)]
        module: Option<String>,
    },
    /// Show a tracked job inside its full parent/children tree.
    Inspect { job_id: JobId },
    /// Submit an ad-hoc job.
    ///
    /// Without `wait` the job is kept alive so it can be inspected after it
    /// finishes; release it when done.
    Run {
        module: String,
        job: String,
        #[serde(default)]
        payload: Value,
        #[serde(default)]
        priority: Option<i32>,
        #[serde(default)]
        wait: bool,
    },
    /// Drop a finished long job from the registry.
    Release { job_id: JobId },
    /// Change a module's concurrency ceiling.
    Concurrency { module: String, concurrency: usize },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum OperatorReply {
    Ok { message: String },
    Status { modules: Vec<ModuleReport> },
    Stats { modules: BTreeMap<String, BTreeMap<String, JobStatistics>> },
    Job { inspection: JobInspection },
    Submitted { job_id: JobId },
    Completed { job_id: JobId, result: JobResult },
    Error { message: String },
}

impl OperatorReply {
    fn error(err: impl std::fmt::Display) -> Self {
        OperatorReply::Error {
            message: err.to_string(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Operator {
    manager: ModuleManager,
}

impl Operator {
    pub fn new(manager: ModuleManager) -> Self {
        Self { manager }
    }

    pub async fn execute(&self, command: OperatorCommand) -> OperatorReply {
        tracing::info!(?command, "operator command");
        match command {
            OperatorCommand::Lockdown => {
                self.manager.lockdown_all();
                OperatorReply::Ok {
                    message: "lockdown engaged".to_string(),
                }
            }
            OperatorCommand::Status => OperatorReply::Status {
                modules: self.manager.reports(),
            },
            OperatorCommand::Stats { module: None } => OperatorReply::Stats {
                modules: self.manager.statistics(),
            },
            OperatorCommand::Stats { module: Some(name) } => {
                match self.manager.module_statistics(&name) {
                    Ok(stats) => OperatorReply::Stats {
                        modules: BTreeMap::from([(name, stats)]),
                    },
                    Err(err) => OperatorReply::error(err),
                }
            }
            OperatorCommand::Inspect { job_id } => match self.manager.inspect(job_id) {
                Ok(inspection) => OperatorReply::Job { inspection },
                Err(err) => OperatorReply::error(err),
            },
            OperatorCommand::Run {
                module,
                job,
                payload,
                priority,
                wait,
            } => self.run(module, job, payload, priority, wait).await,
            OperatorCommand::Release { job_id } => match self.manager.jobs().release(job_id) {
                Ok(_) => OperatorReply::Ok {
                    message: format!("released {job_id}"),
                },
                Err(err) => OperatorReply::error(err),
            },
            OperatorCommand::Concurrency {
                module,
                concurrency,
            } => match self.manager.module(&module) {
                Some(found) => {
                    found.set_concurrency(concurrency);
                    OperatorReply::Ok {
                        message: format!("{module} concurrency set to {concurrency}"),
                    }
                }
                None => OperatorReply::error(crate::SchedulerError::ModuleNotFound(module)),
            },
        }
    }

    async fn run(
        &self,
        module: String,
        job: String,
        payload: Value,
        priority: Option<i32>,
        wait: bool,
    ) -> OperatorReply {
        let Some(target) = self.manager.module(&module) else {
            return OperatorReply::error(crate::SchedulerError::ModuleNotFound(module));
        };
        let mut request = JobRequest::new(job)
            .with_payload(payload)
            .with_keep_alive(!wait);
        if let Some(priority) = priority {
            request = request.with_priority(priority);
        }

        let completion = target.run_job(request);
        let job_id = completion.job_id();
        if !wait {
            return OperatorReply::Submitted { job_id };
        }
        let result = JobResult::from(completion.await);
        OperatorReply::Completed { job_id, result }
    }

    /// Read commands line by line from `reader` and write one JSON reply per
    /// line to `writer`, until the reader is exhausted.
    pub async fn serve<R, W>(&self, reader: R, mut writer: W) -> anyhow::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = reader.lines();
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let reply = match serde_json::from_str::<OperatorCommand>(line) {
                Ok(command) => self.execute(command).await,
                Err(err) => {
                    tracing::warn!(error = %err, "malformed operator command");
                    OperatorReply::error(format!("malformed command: {err}"))
                }
            };
            let mut encoded = serde_json::to_vec(&reply)?;
            encoded.push(b'\n');
            writer.write_all(&encoded).await?;
            writer.flush().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_parse_from_json() {
        let command: OperatorCommand = serde_json::from_str(
            r#"{"command":"run","module":"db","job":"vacuum","payload":{"table":"users"}}"#,
        )
        .unwrap();
        assert_eq!(
            command,
            OperatorCommand::Run {
                module: "db".into(),
                job: "vacuum".into(),
                payload: serde_json::json!({ "table": "users" }),
                priority: None,
                wait: false,
            }
        );

        let command: OperatorCommand = serde_json::from_str(r#"{"command":"stats"}"#).unwrap();
        assert_eq!(command, OperatorCommand::Stats { module: None });
    }

    #[test]
    fn replies_carry_a_tag() {
        let reply = OperatorReply::error("nope");
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["reply"], "error");
        assert_eq!(json["message"], "nope");
    }
}
