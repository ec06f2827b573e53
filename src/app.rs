use std::process::Stdio;
use std::time::Duration;

use anyhow::{anyhow, Context};
use lsp_jsonrpc::{CancellationToken, Connection, ConnectionError, HandlerTable, ResponseError, TracingObserver};
use lsp_types::notification::{Exit, Initialized, LogMessage, PublishDiagnostics};
use lsp_types::request::{
    Initialize, RegisterCapability, Shutdown, WorkDoneProgressCreate, WorkspaceConfiguration,
};
use lsp_types::{
    ClientCapabilities, ClientInfo, InitializeParams, InitializeResult, InitializedParams,
    LogMessageParams, MessageType, Url, WindowClientCapabilities, WorkspaceClientCapabilities,
    WorkspaceFolder,
};
use serde_json::Value;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use crate::cli::Config;

/// Extra time a cancelled request gets to deliver its answer.
const CANCEL_GRACE: Duration = Duration::from_secs(5);
const EXIT_GRACE: Duration = Duration::from_secs(5);

pub async fn run(config: Config) -> anyhow::Result<()> {
    let (mut child, stdin, stdout) = start_server(&config.server, &config.server_args)?;
    tracing::info!(server = %config.server, workspace = %config.workspace.display(), "language server started");

    let conn = Connection::builder()
        .handlers(client_handlers())
        .observer(TracingObserver)
        .error_handler(|error: &ConnectionError| {
            if error.is_end_of_stream() {
                tracing::debug!("language server closed its output");
            } else {
                tracing::error!(%error, "language server connection failed");
            }
        })
        .build(stdin);
    let reader = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.run(stdout).await })
    };

    let session = async {
        let result = request_with_timeout::<Initialize>(
            &conn,
            initialize_params(&config)?,
            config.timeout,
        )
        .await?;
        conn.send_notification::<Initialized>(InitializedParams {})
            .await?;
        request_with_timeout::<Shutdown>(&conn, (), config.timeout).await?;
        conn.send_notification::<Exit>(()).await?;
        Ok::<InitializeResult, anyhow::Error>(result)
    }
    .await;

    stop_server(&mut child).await;
    conn.close();
    match reader.await {
        Ok(Err(error)) => tracing::warn!(%error, "read loop ended with an error"),
        Err(error) => tracing::warn!(%error, "read loop task failed"),
        Ok(Ok(())) => {}
    }

    let result = session?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

/// Sends `R`, cancelling it once `timeout` has elapsed. The server gets
/// [`CANCEL_GRACE`] more to answer the cancelled request before giving up.
async fn request_with_timeout<R>(
    conn: &Connection,
    params: R::Params,
    timeout: Duration,
) -> anyhow::Result<R::Result>
where
    R: lsp_types::request::Request + 'static,
{
    let cancel = CancellationToken::new();
    let timer = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            tracing::warn!(method = R::METHOD, ?timeout, "request timed out, cancelling");
            cancel.cancel();
        })
    };

    let outcome =
        tokio::time::timeout(timeout + CANCEL_GRACE, conn.send_request::<R>(params, &cancel)).await;
    timer.abort();

    let outcome = outcome.map_err(|_| anyhow!("{} was not answered after cancellation", R::METHOD))??;
    outcome.with_context(|| format!("{} failed", R::METHOD))
}

fn initialize_params(config: &Config) -> anyhow::Result<InitializeParams> {
    let uri = Url::from_directory_path(&config.workspace)
        .map_err(|()| anyhow!("workspace {} is not an absolute path", config.workspace.display()))?;
    let name = config
        .workspace
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("workspace")
        .to_string();

    Ok(InitializeParams {
        process_id: Some(std::process::id()),
        workspace_folders: Some(vec![WorkspaceFolder { uri, name }]),
        capabilities: ClientCapabilities {
            window: Some(WindowClientCapabilities {
                work_done_progress: Some(true),
                ..Default::default()
            }),
            workspace: Some(WorkspaceClientCapabilities {
                configuration: Some(true),
                workspace_folders: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        },
        client_info: Some(ClientInfo {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
        }),
        ..Default::default()
    })
}

/// Answers the requests servers commonly send during startup.
fn client_handlers() -> HandlerTable {
    HandlerTable::new()
        .request::<WorkDoneProgressCreate, _, _>(|_, params| async move {
            tracing::debug!(token = ?params.token, "progress token created");
            Ok::<_, ResponseError>(())
        })
        .request::<RegisterCapability, _, _>(|_, params| async move {
            for registration in &params.registrations {
                tracing::debug!(method = %registration.method, "capability registered");
            }
            Ok::<_, ResponseError>(())
        })
        .request::<WorkspaceConfiguration, _, _>(|_, params| async move {
            // No settings: every item resolves to null.
            Ok::<_, ResponseError>(vec![Value::Null; params.items.len()])
        })
        .notification::<LogMessage, _>(log_message)
        .notification::<PublishDiagnostics, _>(|params| {
            tracing::info!(
                uri = %params.uri,
                diagnostics = params.diagnostics.len(),
                "diagnostics published"
            );
        })
}

fn log_message(params: LogMessageParams) {
    let message = params.message;
    match params.typ {
        MessageType::ERROR => tracing::error!(target: "server", "{message}"),
        MessageType::WARNING => tracing::warn!(target: "server", "{message}"),
        MessageType::INFO => tracing::info!(target: "server", "{message}"),
        _ => tracing::debug!(target: "server", "{message}"),
    }
}

fn start_server(
    exe: &str,
    args: &[String],
) -> anyhow::Result<(Child, ChildStdin, ChildStdout)> {
    let mut child = Command::new(exe)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("failed to start {exe}"))?;

    let writer = child
        .stdin
        .take()
        .ok_or_else(|| anyhow!("failed to take child stdin"))?;
    let reader = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("failed to take child stdout"))?;

    Ok((child, writer, reader))
}

async fn stop_server(child: &mut Child) {
    match tokio::time::timeout(EXIT_GRACE, child.wait()).await {
        Ok(Ok(status)) => tracing::info!(%status, "language server exited"),
        Ok(Err(error)) => tracing::warn!(%error, "failed to wait for the language server"),
        Err(_) => {
            tracing::warn!("language server did not exit, killing it");
            if let Err(error) = child.kill().await {
                tracing::warn!(%error, "failed to kill the language server");
            }
        }
    }
}
