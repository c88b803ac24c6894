// Protocol error logging for control lines the parser could not accept.
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::ClientError;

static PROTOCOL_ERROR_LOGS: AtomicUsize = AtomicUsize::new(0);

const PROTOCOL_ERROR_LOG_LIMIT: usize = 20;
const PREVIEW_LEN: usize = 64;

pub(crate) fn log_protocol_error(context: &str, err: &ClientError, line: &[u8]) {
    let count = PROTOCOL_ERROR_LOGS.fetch_add(1, Ordering::Relaxed);
    if count >= PROTOCOL_ERROR_LOG_LIMIT {
        return;
    }
    let preview = &line[..line.len().min(PREVIEW_LEN)];
    let hex = preview
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ");
    let printable = preview
        .iter()
        .map(|b| {
            let c = *b as char;
            if c.is_ascii_graphic() || c == ' ' {
                c
            } else {
                '.'
            }
        })
        .collect::<String>();
    tracing::warn!(
        context,
        error = %err,
        line_len = line.len(),
        preview_hex = %hex,
        preview_printable = %printable,
        "natter protocol error"
    );
}
