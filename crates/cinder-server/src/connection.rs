//! Per-connection task.
//!
//! Reads bytes, frames requests (including the inline trailing-bulk
//! dance), ships argv to the executor, and writes replies back. A
//! connection that becomes a replica or monitor stops parsing and
//! just forwards its stream. All keyspace work happens in the
//! executor; this task owns only buffers.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use cinder_protocol::{Reply, RequestParser, REQUEST_MAX_SIZE};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::config::Config;
use crate::engine::{dispatch, CommandOutcome, EngineHandle, EngineMessage};

/// Initial buffer capacity; grows as needed for large bulks.
const BUF_CAPACITY: usize = 16 * 1024;

pub async fn handle(stream: TcpStream, engine: EngineHandle, config: Arc<Config>, id: u64) {
    if let Err(e) = serve(stream, &engine, config, id).await {
        debug!(client = id, "connection error: {e}");
    }
    let _ = engine
        .tx
        .send(EngineMessage::Disconnect { client: id })
        .await;
}

async fn serve(
    mut stream: TcpStream,
    engine: &EngineHandle,
    config: Arc<Config>,
    id: u64,
) -> io::Result<()> {
    // admission: the executor enforces maxclients
    let (reg_tx, reg_rx) = oneshot::channel();
    if engine
        .tx
        .send(EngineMessage::Register { id, reply: reg_tx })
        .await
        .is_err()
    {
        return Ok(());
    }
    match reg_rx.await {
        Ok(Ok(())) => {}
        Ok(Err(refusal)) => {
            let mut out = BytesMut::new();
            refusal.serialize(&mut out);
            let _ = stream.write_all(&out).await;
            return Ok(());
        }
        Err(_) => return Ok(()),
    }

    let mut parser = RequestParser::new();
    let mut buf = BytesMut::with_capacity(BUF_CAPACITY);
    let mut out = BytesMut::with_capacity(BUF_CAPACITY);

    loop {
        // drain every complete request already buffered (pipelining)
        loop {
            let was_armed = parser.awaiting_trailing_bulk();
            let argv = match parser.next_request(&mut buf) {
                Ok(Some(argv)) => argv,
                Ok(None) => break,
                Err(e) if e.is_fatal() => {
                    out.clear();
                    Reply::error(e.to_string()).serialize(&mut out);
                    let _ = stream.write_all(&out).await;
                    return Ok(());
                }
                Err(e) => {
                    // recoverable framing error: reply, drop the bad
                    // bytes, keep the connection
                    out.clear();
                    Reply::error(e.to_string()).serialize(&mut out);
                    stream.write_all(&out).await?;
                    parser.reset();
                    buf.clear();
                    continue;
                }
            };

            // an inline bulk command's final argument follows the line
            if !was_armed && parser.last_was_inline() {
                if let Some(spec) = dispatch::lookup(&argv[0]) {
                    if spec.flags & dispatch::BULK != 0
                        && spec.arity > 0
                        && argv.len() == spec.arity as usize
                    {
                        match trailing_len(&argv[argv.len() - 1]) {
                            Some(len) => {
                                parser.arm_trailing_bulk(argv[..argv.len() - 1].to_vec(), len);
                                continue;
                            }
                            None => {
                                out.clear();
                                Reply::error("invalid bulk write count").serialize(&mut out);
                                stream.write_all(&out).await?;
                                parser.reset();
                                buf.clear();
                                continue;
                            }
                        }
                    }
                }
            }

            let (reply_tx, reply_rx) = oneshot::channel();
            if engine
                .tx
                .send(EngineMessage::Command {
                    client: id,
                    argv,
                    reply: reply_tx,
                })
                .await
                .is_err()
            {
                return Ok(());
            }
            // blocking pops resolve this future only when served,
            // timed out (executor-enforced deadline) or disconnected
            let outcome = match reply_rx.await {
                Ok(outcome) => outcome,
                Err(_) => return Ok(()),
            };

            match outcome {
                CommandOutcome::Reply(reply) => {
                    out.clear();
                    reply.serialize(&mut out);
                    stream.write_all(&out).await?;
                }
                CommandOutcome::ReplyThenClose(reply) => {
                    out.clear();
                    reply.serialize(&mut out);
                    let _ = stream.write_all(&out).await;
                    return Ok(());
                }
                CommandOutcome::ReplicaStream(rx) => {
                    return forward_stream(stream, rx, None).await;
                }
                CommandOutcome::MonitorStream(rx) => {
                    return forward_stream(stream, rx, Some(b"+OK\r\n")).await;
                }
            }
        }

        // need more bytes; idle clients are reaped after `timeout`
        let read = if config.timeout_secs > 0 {
            match tokio::time::timeout(
                Duration::from_secs(config.timeout_secs),
                stream.read_buf(&mut buf),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => {
                    debug!(client = id, "closing idle connection");
                    return Ok(());
                }
            }
        } else {
            stream.read_buf(&mut buf).await
        };
        match read {
            Ok(0) => return Ok(()), // clean disconnect
            Ok(_) => {}
            Err(e) => return Err(e),
        }
    }
}

/// Forwards a replica or monitor stream until either side goes away.
async fn forward_stream(
    mut stream: TcpStream,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    prefix: Option<&[u8]>,
) -> io::Result<()> {
    if let Some(prefix) = prefix {
        stream.write_all(prefix).await?;
    }
    while let Some(chunk) = rx.recv().await {
        stream.write_all(&chunk).await?;
    }
    Ok(())
}

/// Validates the byte-count token of an inline bulk command.
fn trailing_len(token: &[u8]) -> Option<usize> {
    let len: i64 = std::str::from_utf8(token).ok()?.parse().ok()?;
    if (0..=REQUEST_MAX_SIZE as i64).contains(&len) {
        Some(len as usize)
    } else {
        None
    }
}
