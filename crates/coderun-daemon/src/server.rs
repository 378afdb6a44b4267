//! Unix socket server

use crate::pool::{Verdict, WorkerPool};
use coderun_core::protocol::{self, Request, Response};
use coderun_core::Result;
use std::sync::Arc;
use tokio::net::{UnixListener, UnixStream};

/// Accept connections until the listener fails
pub async fn run(listener: UnixListener, pool: Arc<WorkerPool>) -> Result<()> {
    loop {
        let (stream, _) = listener.accept().await?;
        let pool = Arc::clone(&pool);

        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, pool).await {
                tracing::error!(error = %e, "connection error");
            }
        });
    }
}

/// Serve framed requests on one connection until the client hangs up
async fn handle_connection(mut stream: UnixStream, pool: Arc<WorkerPool>) -> Result<()> {
    while let Some(frame) = protocol::read_frame(&mut stream).await? {
        let response = match protocol::decode::<Request>(&frame) {
            Ok(request) => handle_request(request, &pool).await,
            Err(e) => {
                tracing::warn!(error = %e, "rejecting malformed request");
                Response::Error {
                    message: e.to_string(),
                }
            }
        };

        protocol::write_frame(&mut stream, &protocol::encode(&response)?).await?;
    }

    tracing::debug!("client disconnected");
    Ok(())
}

/// Handle a single request
async fn handle_request(request: Request, pool: &WorkerPool) -> Response {
    match request {
        Request::Execute(submission) => match pool.execute(&submission).await {
            Some(Verdict::Run(result)) => Response::Execute(result.redacted()),
            Some(Verdict::Graded(report)) => Response::Grade(report.redacted()),
            None => Response::Error {
                message: "daemon is shutting down".into(),
            },
        },
        Request::Status => {
            let status = pool.status();
            Response::Status {
                total: status.total,
                idle: status.idle,
                busy: status.busy,
            }
        }
        Request::Ping => Response::Pong,
    }
}
