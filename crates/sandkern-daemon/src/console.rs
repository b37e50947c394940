// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Bridges a kernel TTY to host byte streams

use std::sync::Arc;

use sandkern_core::{FsError, HandleId, IoFlags, Vfs};
use sandkern_proto::ByteCount;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

/// Forward everything processes print on the TTY to `sink`
///
/// Returns once the output handle is closed.
pub async fn pump_output<W>(vfs: Arc<Vfs>, output: HandleId, mut sink: W) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let bytes = match vfs.read(output, ByteCount::All, 0, IoFlags::PRIVILEGED).await {
            Ok(bytes) => bytes,
            Err(FsError::NoSuchFileHandle) => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        trace!(bytes = bytes.len(), "console output");
        sink.write_all(&bytes).await?;
        sink.flush().await?;
    }
}

/// Feed `source` line by line into the TTY's stdin producer
///
/// Lines nobody is reading are dropped. Returns at end of input.
pub async fn pump_input<R>(vfs: Arc<Vfs>, input: HandleId, source: R) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = source.lines();
    while let Some(line) = lines.next_line().await? {
        let mut payload = line.into_bytes();
        payload.push(b'\n');
        let delivered = vfs
            .write(input, &payload, ByteCount::All, 0, IoFlags::PRIVILEGED)
            .await?;
        if delivered == 0 {
            debug!("console input dropped, no process reading stdin");
        }
    }
    Ok(())
}
