//! Test helpers for spawning a cinder-server and speaking its wire
//! protocol.

use std::io::Write;
use std::net::TcpListener;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// A parsed server reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Status(String),
    Error(String),
    Integer(i64),
    Bulk(Vec<u8>),
    Nil,
    Multi(Vec<Reply>),
    NilMulti,
}

/// Options for starting a test server.
#[derive(Default)]
pub struct ServerOptions {
    pub appendonly: bool,
    pub requirepass: Option<String>,
    pub slaveof: Option<u16>,
    pub hash_max_zipmap_entries: Option<usize>,
    /// Enables value paging with the given resident-byte budget.
    pub vm_max_memory: Option<usize>,
}

/// A cinder-server subprocess with its own data directory.
pub struct TestServer {
    child: Child,
    pub port: u16,
    config_path: PathBuf,
    _data_dir: tempfile::TempDir,
}

impl TestServer {
    pub fn start() -> Self {
        Self::start_with(ServerOptions::default())
    }

    pub fn start_with(opts: ServerOptions) -> Self {
        let data_dir = tempfile::tempdir().expect("create temp dir");
        let port = find_free_port();

        let mut config = format!(
            "port {port}\n\
             bind 127.0.0.1\n\
             timeout 0\n\
             loglevel warning\n\
             dir {}\n\
             pidfile {}\n",
            data_dir.path().display(),
            data_dir.path().join("server.pid").display(),
        );
        if opts.appendonly {
            config.push_str("appendonly yes\nappendfsync always\n");
        }
        if let Some(pass) = &opts.requirepass {
            config.push_str(&format!("requirepass {pass}\n"));
        }
        if let Some(master_port) = opts.slaveof {
            config.push_str(&format!("slaveof 127.0.0.1 {master_port}\n"));
        }
        if let Some(entries) = opts.hash_max_zipmap_entries {
            config.push_str(&format!("hash-max-zipmap-entries {entries}\n"));
        }
        if let Some(max) = opts.vm_max_memory {
            config.push_str(&format!(
                "vm-enabled yes\n\
                 vm-swap-file {}\n\
                 vm-max-memory {max}\n\
                 vm-page-size 64\n\
                 vm-pages 16384\n\
                 vm-max-threads 2\n",
                data_dir.path().join("test-%p.swap").display(),
            ));
        }

        let config_path = data_dir.path().join("cinder.conf");
        std::fs::File::create(&config_path)
            .and_then(|mut f| f.write_all(config.as_bytes()))
            .expect("write test config");

        let child = spawn_server(&config_path, port);
        Self {
            child,
            port,
            config_path,
            _data_dir: data_dir,
        }
    }

    /// Kills the server and starts a fresh one on the same data
    /// directory. Used by persistence tests.
    pub fn restart(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        self.child = spawn_server(&self.config_path, self.port);
    }

    pub async fn connect(&self) -> TestClient {
        TestClient::connect(self.port).await
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn spawn_server(config_path: &PathBuf, port: u16) -> Child {
    let binary = server_binary();
    let child = Command::new(&binary)
        .arg(config_path)
        .env("RUST_LOG", "error")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap_or_else(|e| panic!("failed to spawn {}: {e}", binary.display()));

    // wait for the listener
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        if std::net::TcpStream::connect(("127.0.0.1", port)).is_ok() {
            return child;
        }
        if std::time::Instant::now() > deadline {
            panic!("cinder-server did not come up on port {port} within 5s");
        }
        std::thread::sleep(Duration::from_millis(25));
    }
}

/// The compiled server binary, next to the test binary's deps dir.
fn server_binary() -> PathBuf {
    let mut dir = std::env::current_exe()
        .expect("current_exe")
        .parent()
        .expect("exe dir")
        .to_path_buf();
    if dir.ends_with("deps") {
        dir.pop();
    }
    dir.join("cinder-server")
}

fn find_free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind port 0");
    listener.local_addr().expect("local addr").port()
}

/// A minimal wire-protocol client.
pub struct TestClient {
    stream: TcpStream,
    buf: BytesMut,
}

impl TestClient {
    pub async fn connect(port: u16) -> Self {
        let stream = TcpStream::connect(("127.0.0.1", port))
            .await
            .unwrap_or_else(|e| panic!("connect to 127.0.0.1:{port}: {e}"));
        Self {
            stream,
            buf: BytesMut::with_capacity(4096),
        }
    }

    /// Sends a command in multi-bulk framing without awaiting a
    /// reply. Used by the blocking-pop tests.
    pub async fn send(&mut self, args: &[&str]) {
        let mut out = Vec::new();
        out.extend_from_slice(format!("*{}\r\n", args.len()).as_bytes());
        for arg in args {
            out.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
            out.extend_from_slice(arg.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        self.stream.write_all(&out).await.expect("send command");
    }

    /// Sends raw bytes (for inline / malformed framing tests).
    pub async fn send_raw(&mut self, raw: &[u8]) {
        self.stream.write_all(raw).await.expect("send raw");
    }

    /// Reads the next complete reply.
    pub async fn read_reply(&mut self) -> Reply {
        loop {
            if let Some(reply) = try_parse(&mut self.buf) {
                return reply;
            }
            let n = self.stream.read_buf(&mut self.buf).await.expect("read");
            if n == 0 {
                panic!("server closed the connection mid-reply");
            }
        }
    }

    pub async fn cmd(&mut self, args: &[&str]) -> Reply {
        self.send(args).await;
        self.read_reply().await
    }

    pub async fn ok(&mut self, args: &[&str]) {
        match self.cmd(args).await {
            Reply::Status(s) if s == "OK" => {}
            other => panic!("expected +OK for {args:?}, got {other:?}"),
        }
    }

    pub async fn get_int(&mut self, args: &[&str]) -> i64 {
        match self.cmd(args).await {
            Reply::Integer(n) => n,
            other => panic!("expected integer for {args:?}, got {other:?}"),
        }
    }

    pub async fn get_bulk(&mut self, args: &[&str]) -> Option<String> {
        match self.cmd(args).await {
            Reply::Bulk(data) => Some(String::from_utf8_lossy(&data).into_owned()),
            Reply::Nil => None,
            other => panic!("expected bulk for {args:?}, got {other:?}"),
        }
    }

    pub async fn get_multi(&mut self, args: &[&str]) -> Vec<Reply> {
        match self.cmd(args).await {
            Reply::Multi(items) => items,
            other => panic!("expected multi-bulk for {args:?}, got {other:?}"),
        }
    }

    /// Multi-bulk reply flattened to strings (nils skipped).
    pub async fn get_strings(&mut self, args: &[&str]) -> Vec<String> {
        self.get_multi(args)
            .await
            .into_iter()
            .filter_map(|item| match item {
                Reply::Bulk(data) => Some(String::from_utf8_lossy(&data).into_owned()),
                Reply::Nil => None,
                other => panic!("expected bulk rows, got {other:?}"),
            })
            .collect()
    }

    pub async fn err(&mut self, args: &[&str]) -> String {
        match self.cmd(args).await {
            Reply::Error(msg) => msg,
            other => panic!("expected error for {args:?}, got {other:?}"),
        }
    }
}

/// Attempts to parse one reply from the front of `buf`, consuming it.
fn try_parse(buf: &mut BytesMut) -> Option<Reply> {
    let mut pos = 0;
    let reply = parse_at(&buf[..], &mut pos)?;
    buf.advance(pos);
    Some(reply)
}

fn parse_at(data: &[u8], pos: &mut usize) -> Option<Reply> {
    let prefix = *data.get(*pos)?;
    *pos += 1;
    let line = read_line(data, pos)?;
    match prefix {
        b'+' => Some(Reply::Status(line)),
        b'-' => Some(Reply::Error(line)),
        b':' => Some(Reply::Integer(line.parse().expect("integer reply"))),
        b'$' => {
            let len: i64 = line.parse().expect("bulk length");
            if len < 0 {
                return Some(Reply::Nil);
            }
            let len = len as usize;
            if data.len() < *pos + len + 2 {
                return None;
            }
            let payload = data[*pos..*pos + len].to_vec();
            *pos += len + 2;
            Some(Reply::Bulk(payload))
        }
        b'*' => {
            let count: i64 = line.parse().expect("multi-bulk count");
            if count < 0 {
                return Some(Reply::NilMulti);
            }
            let mut items = Vec::with_capacity(count as usize);
            for _ in 0..count {
                items.push(parse_at(data, pos)?);
            }
            Some(Reply::Multi(items))
        }
        other => panic!("unexpected reply prefix {other:?}"),
    }
}

fn read_line(data: &[u8], pos: &mut usize) -> Option<String> {
    let nl = data[*pos..].iter().position(|&b| b == b'\n')? + *pos;
    let mut end = nl;
    if end > *pos && data[end - 1] == b'\r' {
        end -= 1;
    }
    let line = String::from_utf8_lossy(&data[*pos..end]).into_owned();
    *pos = nl + 1;
    Some(line)
}
