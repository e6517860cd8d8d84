//! CommandExecutor - 1 イテレーションごとに外部コマンドを起動する IterationExecutor
//!
//! - 環境変数: HIVE_TASK_ID / HIVE_LOOP_ID / HIVE_ITERATION / HIVE_MAX_ITERATIONS
//! - stdin: イテレーションのコンテキスト（タスクと完了マーカーの説明）
//! - exit 0 を成功とみなす。出力は stdout + stderr
//! - `kill_on_drop(true)`: ループ側の timeout で future が drop されると子プロセスも kill される

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::domain::HiveError;
use crate::ports::{IterationExecutor, IterationOutput, IterationRequest};

#[derive(Debug, Clone)]
pub struct CommandExecutor {
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
    instructions: Option<String>,
}

impl CommandExecutor {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            instructions: None,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Free-form task text appended to the iteration context.
    pub fn instructions(mut self, text: impl Into<String>) -> Self {
        self.instructions = Some(text.into());
        self
    }

    fn context(&self, request: &IterationRequest) -> String {
        let mut context = format!(
            "## Loop context\n\
             - Loop ID: {}\n\
             - Task ID: {}\n\
             - Iteration: {} of {}\n\
             \n\
             ## Instructions\n\
             - Work on the task until complete\n\
             - When everything is done, output: LOOP_COMPLETE\n\
             - State persists between iterations via files\n",
            request.loop_id, request.task_id, request.iteration, request.max_iterations
        );
        if let Some(text) = &self.instructions {
            context.push_str("\n## Task\n");
            context.push_str(text);
            context.push('\n');
        }
        context
    }
}

#[async_trait]
impl IterationExecutor for CommandExecutor {
    async fn execute(&self, request: IterationRequest) -> Result<IterationOutput, HiveError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .env("HIVE_TASK_ID", request.task_id.as_str())
            .env("HIVE_LOOP_ID", request.loop_id.as_str())
            .env("HIVE_ITERATION", request.iteration.to_string())
            .env("HIVE_MAX_ITERATIONS", request.max_iterations.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let mut child = command
            .spawn()
            .map_err(|e| HiveError::Execution(format!("cannot spawn {}: {e}", self.program)))?;

        if let Some(mut stdin) = child.stdin.take() {
            // A child that never reads stdin closes the pipe; that is not a failure.
            if let Err(e) = stdin.write_all(self.context(&request).as_bytes()).await {
                debug!(error = %e, "child did not accept iteration context");
            }
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| HiveError::Execution(format!("{} failed: {e}", self.program)))?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        debug!(
            task_id = %request.task_id,
            iteration = request.iteration,
            status = %output.status,
            "command finished"
        );

        Ok(IterationOutput {
            success: output.status.success(),
            output: text,
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::domain::{LoopId, TaskId};
    use chrono::Utc;

    fn request(iteration: u32) -> IterationRequest {
        let task_id = TaskId::new("t1");
        IterationRequest {
            loop_id: LoopId::derive(Utc::now(), &task_id),
            task_id,
            iteration,
            max_iterations: 5,
        }
    }

    #[tokio::test]
    async fn passes_env_and_captures_output() {
        let exec = CommandExecutor::new("sh").args([
            "-c",
            "echo \"$HIVE_TASK_ID $HIVE_ITERATION/$HIVE_MAX_ITERATIONS\"; echo warn >&2",
        ]);
        let out = exec.execute(request(2)).await.unwrap();
        assert!(out.success);
        assert!(out.output.contains("t1 2/5"));
        assert!(out.output.contains("warn"));
    }

    #[tokio::test]
    async fn context_arrives_on_stdin() {
        let exec = CommandExecutor::new("sh")
            .args(["-c", "cat"])
            .instructions("fix the flaky test");
        let out = exec.execute(request(1)).await.unwrap();
        assert!(out.output.contains("Iteration: 1 of 5"));
        assert!(out.output.contains("fix the flaky test"));
    }

    #[tokio::test]
    async fn non_zero_exit_is_failure() {
        let exec = CommandExecutor::new("sh").args(["-c", "echo nope; exit 3"]);
        let out = exec.execute(request(1)).await.unwrap();
        assert!(!out.success);
        assert!(out.output.contains("nope"));
    }

    #[tokio::test]
    async fn missing_program_is_execution_error() {
        let exec = CommandExecutor::new("/definitely/not/a/program");
        let err = exec.execute(request(1)).await.unwrap_err();
        assert!(matches!(err, HiveError::Execution(_)));
    }
}
