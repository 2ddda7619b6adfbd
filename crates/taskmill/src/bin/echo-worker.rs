//! Minimal worker binary used by the integration tests and as a template for
//! real worker programs: implement [`TaskHandler`], hand it to
//! [`run_worker`], done.

use anyhow::Context as _;
use async_trait::async_trait;
use serde_json::json;
use tracing_subscriber::EnvFilter;

use taskmill::{run_worker, RemoteFault, TaskHandler, TaskSpec};

struct EchoHandler;

#[async_trait]
impl TaskHandler for EchoHandler {
    async fn run(&self, task: TaskSpec) -> Result<serde_json::Value, RemoteFault> {
        match task.name.as_str() {
            "echo" => Ok(task.input),
            "sleep-ms" => {
                let ms = task.input.as_u64().unwrap_or(0);
                tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
                Ok(task.input)
            }
            "sum" => {
                let total: i64 = task
                    .input
                    .as_array()
                    .map(|items| items.iter().filter_map(|v| v.as_i64()).sum())
                    .unwrap_or(0);
                Ok(json!(total))
            }
            "fail" => Err(RemoteFault::new(
                "TaskError",
                task.input.as_str().unwrap_or("told to fail").to_string(),
            )),
            "panic" => panic!("told to panic"),
            other => Err(RemoteFault::new("UnknownTask", other.to_string())),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout stays free for the host.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    run_worker(EchoHandler)
        .await
        .context("worker terminated abnormally")
}
