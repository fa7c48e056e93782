/*!
 * Script Sandbox - Main Entry Point
 *
 * Reads a script from stdin, runs it under the sandbox policy and prints the
 * execution result as JSON.
 */

use anyhow::Context;
use script_sandbox::{init_tracing, Coordinator, ExecutionRequest, SandboxConfig};
use std::io::Read;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = SandboxConfig::from_env().context("loading sandbox configuration")?;
    let coordinator = Coordinator::new(config).context("building coordinator")?;

    let mut source = String::new();
    std::io::stdin()
        .read_to_string(&mut source)
        .context("reading script from stdin")?;
    let language = std::env::var("SANDBOX_LANGUAGE").unwrap_or_else(|_| "javascript".to_string());

    let request = ExecutionRequest::new(source, language);
    info!(execution_id = %request.id(), "Executing script from stdin");

    let mut execution = tokio::spawn({
        let coordinator = coordinator.clone();
        async move { coordinator.execute_securely(request).await }
    });

    let joined = tokio::select! {
        joined = &mut execution => joined,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, terminating execution");
            coordinator.shutdown().await;
            execution.await
        }
    };
    let result = joined.context("execution task failed")?;

    println!(
        "{}",
        serde_json::to_string_pretty(&result).context("serializing execution result")?
    );
    coordinator.shutdown().await;

    if !result.success {
        std::process::exit(1);
    }
    Ok(())
}
