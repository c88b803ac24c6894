// Inbound protocol loop: decode server control lines and dispatch them to a
// ProtocolHandler until the connection breaks or shutdown is signalled.
use async_trait::async_trait;
use natter_wire::ServerOp;
use tokio::io::AsyncBufRead;
use tokio::sync::watch;

use crate::client::Msg;
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::wire::{log_protocol_error, read_control_line, read_payload};

/// Hooks invoked by the parser loop, one per inbound operation.
///
/// `process_op_err` is terminal: the loop never reads again after calling it.
#[async_trait]
pub(crate) trait ProtocolHandler: Send + Sync {
    fn process_info(&self, info: &str);
    fn process_msg(&self, msg: Msg);
    async fn process_ping(&self);
    fn process_pong(&self);
    fn process_err(&self, message: &str);
    async fn process_op_err(&self, err: ClientError);
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct ParserLimits {
    pub(crate) max_control_line_bytes: usize,
    pub(crate) max_payload_bytes: usize,
}

impl From<&ClientConfig> for ParserLimits {
    fn from(config: &ClientConfig) -> Self {
        Self {
            max_control_line_bytes: config.max_control_line_bytes,
            max_payload_bytes: config.max_payload_bytes,
        }
    }
}

pub(crate) async fn run_parser_loop<R, H>(
    mut reader: R,
    handler: &H,
    limits: ParserLimits,
    mut shutdown_rx: watch::Receiver<bool>,
) where
    R: AsyncBufRead + Unpin,
    H: ProtocolHandler + ?Sized,
{
    let mut line = Vec::with_capacity(256);
    loop {
        let result = tokio::select! {
            result = process_next(&mut reader, &mut line, &limits, handler) => result,
            _ = wait_for_shutdown(&mut shutdown_rx) => {
                tracing::debug!("parser loop shut down");
                return;
            }
        };
        if let Err(err) = result {
            if matches!(
                err,
                ClientError::Protocol(_)
                    | ClientError::ControlLineTooLong { .. }
                    | ClientError::PayloadTooLarge { .. }
            ) {
                log_protocol_error("parser_loop", &err, &line);
            }
            handler.process_op_err(err).await;
            return;
        }
    }
}

async fn wait_for_shutdown(shutdown_rx: &mut watch::Receiver<bool>) {
    // A dropped sender means the owning client is gone.
    let _ = shutdown_rx.wait_for(|stop| *stop).await;
}

async fn process_next<R, H>(
    reader: &mut R,
    line: &mut Vec<u8>,
    limits: &ParserLimits,
    handler: &H,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    H: ProtocolHandler + ?Sized,
{
    read_control_line(reader, line, limits.max_control_line_bytes).await?;
    let text = std::str::from_utf8(line).map_err(|_| {
        ClientError::Protocol(natter_wire::Error::BadControlLine(
            String::from_utf8_lossy(line).into_owned(),
        ))
    })?;
    match ServerOp::parse(text)? {
        ServerOp::Msg(args) => {
            if args.size > limits.max_payload_bytes {
                return Err(ClientError::PayloadTooLarge {
                    size: args.size,
                    limit: limits.max_payload_bytes,
                });
            }
            let payload = read_payload(reader, args.size).await?;
            handler.process_msg(Msg {
                subject: args.subject.to_string(),
                reply: args.reply.map(str::to_string),
                sid: args.sid,
                payload,
            });
        }
        ServerOp::Info(info) => handler.process_info(info),
        ServerOp::Ping => handler.process_ping().await,
        ServerOp::Pong => handler.process_pong(),
        ServerOp::Ok => {}
        ServerOp::Err(message) => handler.process_err(message),
        ServerOp::Unknown(op) => {
            tracing::debug!(op, "ignoring unknown server operation");
        }
    }
    Ok(())
}
