//! Line-delimited JSON-RPC entry mode on the gateway's own stdin/stdout.
//!
//! A parent process that launches the gateway without a terminal can list the
//! registered services and call them without going through HTTP. Every
//! response is one JSON line on stdout; logs never share that channel.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use super::*;

const JSONRPC_VERSION: &str = "2.0";
const JSONRPC_ERROR_INVALID_REQUEST: i64 = -32600;
const JSONRPC_ERROR_METHOD_NOT_FOUND: i64 = -32601;
const JSONRPC_ERROR_INVALID_PARAMS: i64 = -32602;
const JSONRPC_ERROR_INTERNAL: i64 = -32603;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(super) struct GatewayStdioReport {
    pub(super) processed_frames: usize,
    pub(super) error_count: usize,
}

struct StdioDispatchError {
    code: i64,
    message: String,
}

impl StdioDispatchError {
    fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CallServiceParams {
    service_id: String,
    request: Value,
}

/// Serves the process's stdin/stdout until stdin reaches end of file.
pub(super) async fn run_gateway_stdio(state: Arc<GatewayState>) -> Result<GatewayStdioReport> {
    info!("stdio entry mode started");
    let reader = BufReader::new(tokio::io::stdin());
    let writer = tokio::io::stdout();
    let report = serve_gateway_stdio(&state, reader, writer).await?;
    info!(
        processed_frames = report.processed_frames,
        error_count = report.error_count,
        "stdio entry mode reached end of input; HTTP listener keeps running"
    );
    Ok(report)
}

pub(super) async fn serve_gateway_stdio<R, W>(
    state: &GatewayState,
    reader: R,
    mut writer: W,
) -> Result<GatewayStdioReport>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();
    let mut report = GatewayStdioReport::default();
    while let Some(line) = lines
        .next_line()
        .await
        .context("failed to read stdio request line")?
    {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        report.processed_frames = report.processed_frames.saturating_add(1);
        let response = match serde_json::from_str::<Value>(line) {
            Ok(request) => {
                let id = request.get("id").cloned().unwrap_or(Value::Null);
                match dispatch_stdio_request(state, &request).await {
                    Ok(result) => jsonrpc_result_frame(id, result),
                    Err(error) => {
                        report.error_count = report.error_count.saturating_add(1);
                        jsonrpc_error_frame(id, error.code, error.message)
                    }
                }
            }
            Err(error) => {
                debug!(error = %error, "stdio request is not valid JSON");
                report.error_count = report.error_count.saturating_add(1);
                jsonrpc_error_frame(Value::Null, JSONRPC_ERROR_INTERNAL, "Internal error")
            }
        };
        write_stdio_frame(&mut writer, &response).await?;
    }
    Ok(report)
}

async fn dispatch_stdio_request(
    state: &GatewayState,
    request: &Value,
) -> Result<Value, StdioDispatchError> {
    let Some(object) = request.as_object() else {
        return Err(StdioDispatchError::new(
            JSONRPC_ERROR_INVALID_REQUEST,
            "jsonrpc request must be an object",
        ));
    };
    let Some(method) = object.get("method").and_then(Value::as_str) else {
        return Err(StdioDispatchError::new(
            JSONRPC_ERROR_INVALID_REQUEST,
            "jsonrpc request must include a method",
        ));
    };
    match method {
        "list_services" => Ok(json!({"services": state.registry.ids()})),
        "call_service" => {
            let params = object.get("params").cloned().unwrap_or(Value::Null);
            let params = serde_json::from_value::<CallServiceParams>(params).map_err(|error| {
                StdioDispatchError::new(
                    JSONRPC_ERROR_INVALID_PARAMS,
                    format!("call_service params must be {{serviceId, request}}: {error}"),
                )
            })?;
            bridge_handlers::forward_to_service(state, &params.service_id, params.request)
                .await
                .map_err(|error| StdioDispatchError::new(JSONRPC_ERROR_INTERNAL, error.message))
        }
        other => Err(StdioDispatchError::new(
            JSONRPC_ERROR_METHOD_NOT_FOUND,
            format!("Method not found: {other}"),
        )),
    }
}

async fn write_stdio_frame<W>(writer: &mut W, frame: &Value) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_vec(frame).context("failed to encode stdio response")?;
    line.push(b'\n');
    writer
        .write_all(&line)
        .await
        .context("failed to write stdio response")?;
    writer.flush().await.context("failed to flush stdio response")
}

fn jsonrpc_result_frame(id: Value, result: Value) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "result": result,
    })
}

fn jsonrpc_error_frame(id: Value, code: i64, message: impl Into<String>) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "error": {
            "code": code,
            "message": message.into(),
        }
    })
}
