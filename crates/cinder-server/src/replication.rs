//! Replication plumbing.
//!
//! Master side: after the executor finishes a background save for a
//! SYNCing replica, [`stream_dump`] ships the dump file as a
//! `$<len>` bulk followed by raw bytes; the executor then flushes
//! the accumulated command stream and feeds live mutations.
//!
//! Replica side: [`spawn_replica_link`] owns the TCP link to the
//! master. Each cycle it connects, authenticates, issues `SYNC`,
//! downloads the dump to a temp file, renames it over the local
//! snapshot, tells the executor to load it, and then relays the
//! master's live command stream. Any error tears the link down and
//! the loop reconnects on the next cycle.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use cinder_protocol::RequestParser;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::EngineEvent;

/// Pause between reconnection attempts.
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Dump file chunk size on both the send and receive paths.
const CHUNK: usize = 64 * 1024;

/// Master side: streams the dump file into a replica's reply queue.
pub(crate) async fn stream_dump(
    path: &Path,
    tx: &mpsc::UnboundedSender<Bytes>,
) -> io::Result<()> {
    let mut file = tokio::fs::File::open(path).await?;
    let len = file.metadata().await?.len();

    let closed = || io::Error::new(io::ErrorKind::BrokenPipe, "replica went away");
    tx.send(Bytes::from(format!("${len}\r\n")))
        .map_err(|_| closed())?;

    let mut chunk = vec![0u8; CHUNK];
    loop {
        let n = file.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        tx.send(Bytes::copy_from_slice(&chunk[..n]))
            .map_err(|_| closed())?;
    }
}

/// Replica side: the reconnecting master link.
pub(crate) fn spawn_replica_link(
    host: String,
    port: u16,
    masterauth: Option<String>,
    dump_path: PathBuf,
    generation: u64,
    events: mpsc::UnboundedSender<EngineEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match sync_once(
                &host,
                port,
                masterauth.as_deref(),
                &dump_path,
                generation,
                &events,
            )
            .await
            {
                Ok(()) => debug!("master link closed"),
                Err(e) => warn!("replication link error: {e}"),
            }
            if events
                .send(EngineEvent::MasterLinkDown { generation })
                .is_err()
            {
                return; // executor gone
            }
            tokio::time::sleep(RETRY_DELAY).await;
        }
    })
}

/// One full replication cycle: handshake, dump download, live stream.
async fn sync_once(
    host: &str,
    port: u16,
    masterauth: Option<&str>,
    dump_path: &Path,
    generation: u64,
    events: &mpsc::UnboundedSender<EngineEvent>,
) -> io::Result<()> {
    info!(%host, port, "connecting to master");
    let mut stream = TcpStream::connect((host, port)).await?;
    let mut buf = BytesMut::with_capacity(CHUNK);

    if let Some(pass) = masterauth {
        stream
            .write_all(format!("AUTH {pass}\r\n").as_bytes())
            .await?;
        let line = read_line(&mut stream, &mut buf).await?;
        if !line.starts_with('+') {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("master rejected AUTH: {line}"),
            ));
        }
    }

    stream.write_all(b"SYNC\r\n").await?;
    let header = read_line(&mut stream, &mut buf).await?;
    let len: u64 = header
        .strip_prefix('$')
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("bad SYNC bulk header: {header}"),
            )
        })?;
    info!(bytes = len, "MASTER <-> REPLICA sync: receiving dump");

    // download to a temp file, then atomically replace the snapshot
    let tmp = dump_path.with_extension("repl.tmp");
    {
        let mut file = tokio::fs::File::create(&tmp).await?;
        let mut remaining = len;
        while remaining > 0 {
            if buf.is_empty() && stream.read_buf(&mut buf).await? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "master closed mid-dump",
                ));
            }
            let take = (buf.len() as u64).min(remaining) as usize;
            file.write_all(&buf[..take]).await?;
            buf.advance(take);
            remaining -= take as u64;
        }
        file.sync_all().await?;
    }
    tokio::fs::rename(&tmp, dump_path).await?;

    if events.send(EngineEvent::MasterDump { generation }).is_err() {
        return Ok(());
    }

    // live stream: the master talks to us like a client talks to it
    let mut parser = RequestParser::new();
    loop {
        loop {
            match parser.next_request(&mut buf) {
                Ok(Some(argv)) => {
                    if events
                        .send(EngineEvent::MasterCommand { generation, argv })
                        .is_err()
                    {
                        return Ok(());
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("malformed master stream: {e}"),
                    ))
                }
            }
        }
        if stream.read_buf(&mut buf).await? == 0 {
            return Ok(());
        }
    }
}

/// Reads one `\r\n`-terminated line (the AUTH reply and the bulk
/// header), leaving any excess bytes in `buf`.
async fn read_line(stream: &mut TcpStream, buf: &mut BytesMut) -> io::Result<String> {
    loop {
        if let Some(nl) = buf.iter().position(|&b| b == b'\n') {
            let line = buf.split_to(nl + 1);
            let mut end = line.len() - 1;
            if end > 0 && line[end - 1] == b'\r' {
                end -= 1;
            }
            return Ok(String::from_utf8_lossy(&line[..end]).into_owned());
        }
        if stream.read_buf(buf).await? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "master closed during handshake",
            ));
        }
    }
}
