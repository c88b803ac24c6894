// Low-level control line and payload reads over a buffered byte stream.
use bytes::{Bytes, BytesMut};
use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::error::{ClientError, Result};

/// Reads one `\n`-terminated control line into `line`, terminator included.
///
/// A clean EOF before any byte arrives and an EOF mid-line are both reported
/// as `UnexpectedEof`; the protocol has no graceful server-side close.
pub(crate) async fn read_control_line<R>(
    reader: &mut R,
    line: &mut Vec<u8>,
    max_len: usize,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    line.clear();
    let read = AsyncReadExt::take(&mut *reader, max_len as u64)
        .read_until(b'\n', line)
        .await?;
    if read == 0 {
        return Err(eof("connection closed by server"));
    }
    if line.last() != Some(&b'\n') {
        if read >= max_len {
            return Err(ClientError::ControlLineTooLong { limit: max_len });
        }
        return Err(eof("connection closed mid control line"));
    }
    Ok(())
}

/// Reads exactly `size` payload bytes followed by the mandatory CRLF.
pub(crate) async fn read_payload<R>(reader: &mut R, size: usize) -> Result<Bytes>
where
    R: AsyncBufRead + Unpin,
{
    let mut payload = BytesMut::zeroed(size + natter_wire::CRLF.len());
    reader.read_exact(&mut payload).await?;
    if &payload[size..] != natter_wire::CRLF {
        return Err(ClientError::Protocol(natter_wire::Error::BadControlLine(
            format!("payload of {size} bytes not followed by CRLF"),
        )));
    }
    payload.truncate(size);
    Ok(payload.freeze())
}

fn eof(message: &'static str) -> ClientError {
    ClientError::Io(io::Error::new(io::ErrorKind::UnexpectedEof, message))
}
