//! Server configuration.
//!
//! Directives live one per line in a plain text file: a keyword and
//! its arguments, `#` starting a comment. Every directive has a
//! default, so running without a file works for development.

use std::path::{Path, PathBuf};

use cinder_persistence::FsyncPolicy;
use thiserror::Error;

/// Value-paging settings (the `vm-*` directives).
#[derive(Debug, Clone)]
pub struct VmConfig {
    pub swap_file: PathBuf,
    /// Resident value bytes allowed before swap-out kicks in.
    pub max_memory: usize,
    pub page_size: usize,
    pub pages: usize,
    pub max_threads: usize,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    /// Idle client timeout in seconds; 0 disables it.
    pub timeout_secs: u64,
    /// Background-save triggers: (seconds, changes) pairs, any of
    /// which fires a save when both thresholds are met.
    pub save_points: Vec<(u64, u64)>,
    pub dir: PathBuf,
    pub loglevel: String,
    pub logfile: Option<PathBuf>,
    pub databases: usize,
    /// 0 = unlimited.
    pub maxclients: usize,
    /// 0 = unlimited.
    pub maxmemory: usize,
    pub slaveof: Option<(String, u16)>,
    pub masterauth: Option<String>,
    pub requirepass: Option<String>,
    pub appendonly: bool,
    pub appendfsync: FsyncPolicy,
    pub dbfilename: String,
    pub appendfilename: String,
    pub daemonize: bool,
    pub pidfile: PathBuf,
    pub rdbcompression: bool,
    pub hash_max_zipmap_entries: usize,
    pub hash_max_zipmap_value: usize,
    pub vm: Option<VmConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 6379,
            bind: "127.0.0.1".into(),
            timeout_secs: 300,
            save_points: vec![(3600, 1), (300, 100), (60, 10_000)],
            dir: PathBuf::from("."),
            loglevel: "notice".into(),
            logfile: None,
            databases: 16,
            maxclients: 0,
            maxmemory: 0,
            slaveof: None,
            masterauth: None,
            requirepass: None,
            appendonly: false,
            appendfsync: FsyncPolicy::EverySecond,
            dbfilename: "dump.rdb".into(),
            appendfilename: "appendonly.aof".into(),
            daemonize: false,
            pidfile: PathBuf::from("/var/run/cinder.pid"),
            rdbcompression: true,
            hash_max_zipmap_entries: 64,
            hash_max_zipmap_value: 512,
            vm: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("line {line}: {message}")]
    Bad { line: usize, message: String },
}

/// Builder state for the `vm-*` directives; assembled into
/// `Config::vm` only when `vm-enabled yes`.
#[derive(Debug, Clone)]
struct VmDirectives {
    enabled: bool,
    swap_file: String,
    max_memory: usize,
    page_size: usize,
    pages: usize,
    max_threads: usize,
}

impl Default for VmDirectives {
    fn default() -> Self {
        Self {
            enabled: false,
            swap_file: "/tmp/cinder-%p.swap".into(),
            max_memory: 0,
            page_size: 256,
            pages: 1024 * 1024,
            max_threads: 4,
        }
    }
}

impl Config {
    /// Parses a config file, layering directives over the defaults.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Parses config text (see module docs for the format).
    pub fn parse(text: &str) -> Result<Config, ConfigError> {
        let mut config = Config::default();
        let mut vm = VmDirectives::default();
        let mut save_points = Vec::new();
        let mut saw_save = false;

        for (idx, raw) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.split_whitespace();
            let keyword = parts.next().expect("non-empty line").to_ascii_lowercase();
            let args: Vec<&str> = parts.collect();

            let bad = |message: String| ConfigError::Bad {
                line: line_no,
                message,
            };

            match keyword.as_str() {
                "port" => config.port = parse_one(&args, &bad)?,
                "bind" => config.bind = one_arg(&args, &bad)?.to_string(),
                "timeout" => config.timeout_secs = parse_one(&args, &bad)?,
                "save" => {
                    if args.len() != 2 {
                        return Err(bad("save wants <seconds> <changes>".into()));
                    }
                    let secs = parse_arg(args[0], &bad)?;
                    let changes = parse_arg(args[1], &bad)?;
                    save_points.push((secs, changes));
                    saw_save = true;
                }
                "dir" => config.dir = PathBuf::from(one_arg(&args, &bad)?),
                "loglevel" => config.loglevel = one_arg(&args, &bad)?.to_string(),
                "logfile" => {
                    let arg = one_arg(&args, &bad)?;
                    config.logfile = match arg {
                        "stdout" | "" => None,
                        path => Some(PathBuf::from(path)),
                    };
                }
                "databases" => {
                    config.databases = parse_one(&args, &bad)?;
                    if config.databases == 0 {
                        return Err(bad("databases must be at least 1".into()));
                    }
                }
                "maxclients" => config.maxclients = parse_one(&args, &bad)?,
                "maxmemory" => config.maxmemory = parse_bytes(one_arg(&args, &bad)?, &bad)?,
                "slaveof" => {
                    if args.len() != 2 {
                        return Err(bad("slaveof wants <host> <port>".into()));
                    }
                    let port = parse_arg(args[1], &bad)?;
                    config.slaveof = Some((args[0].to_string(), port));
                }
                "masterauth" => config.masterauth = Some(one_arg(&args, &bad)?.to_string()),
                "requirepass" => config.requirepass = Some(one_arg(&args, &bad)?.to_string()),
                "appendonly" => config.appendonly = parse_yes_no(one_arg(&args, &bad)?, &bad)?,
                "appendfsync" => {
                    config.appendfsync = match one_arg(&args, &bad)?.to_ascii_lowercase().as_str() {
                        "no" => FsyncPolicy::Never,
                        "everysec" => FsyncPolicy::EverySecond,
                        "always" => FsyncPolicy::Always,
                        other => {
                            return Err(bad(format!(
                                "unknown appendfsync '{other}' (no|always|everysec)"
                            )))
                        }
                    };
                }
                "dbfilename" => config.dbfilename = one_arg(&args, &bad)?.to_string(),
                "appendfilename" => config.appendfilename = one_arg(&args, &bad)?.to_string(),
                "daemonize" => config.daemonize = parse_yes_no(one_arg(&args, &bad)?, &bad)?,
                "pidfile" => config.pidfile = PathBuf::from(one_arg(&args, &bad)?),
                "rdbcompression" => {
                    config.rdbcompression = parse_yes_no(one_arg(&args, &bad)?, &bad)?
                }
                "hash-max-zipmap-entries" => {
                    config.hash_max_zipmap_entries = parse_one(&args, &bad)?
                }
                "hash-max-zipmap-value" => config.hash_max_zipmap_value = parse_one(&args, &bad)?,
                "vm-enabled" => vm.enabled = parse_yes_no(one_arg(&args, &bad)?, &bad)?,
                "vm-swap-file" => vm.swap_file = one_arg(&args, &bad)?.to_string(),
                "vm-max-memory" => vm.max_memory = parse_bytes(one_arg(&args, &bad)?, &bad)?,
                "vm-page-size" => vm.page_size = parse_one(&args, &bad)?,
                "vm-pages" => vm.pages = parse_one(&args, &bad)?,
                "vm-max-threads" => vm.max_threads = parse_one(&args, &bad)?,
                other => return Err(bad(format!("unknown directive '{other}'"))),
            }
        }

        if saw_save {
            config.save_points = save_points;
        }
        if vm.enabled {
            config.vm = Some(VmConfig {
                swap_file: PathBuf::from(substitute_pid(&vm.swap_file)),
                max_memory: vm.max_memory,
                page_size: vm.page_size.max(32),
                pages: vm.pages.max(1),
                max_threads: vm.max_threads.clamp(1, 64),
            });
        }
        Ok(config)
    }

    /// Full path of the snapshot file.
    pub fn db_path(&self) -> PathBuf {
        self.dir.join(&self.dbfilename)
    }

    /// Full path of the append-only journal.
    pub fn aof_path(&self) -> PathBuf {
        self.dir.join(&self.appendfilename)
    }
}

/// Replaces the `%p` token with the running process id.
fn substitute_pid(path: &str) -> String {
    path.replace("%p", &std::process::id().to_string())
}

fn one_arg<'a>(
    args: &[&'a str],
    bad: &impl Fn(String) -> ConfigError,
) -> Result<&'a str, ConfigError> {
    match args {
        [single] => Ok(single),
        _ => Err(bad(format!("expected exactly one argument, got {}", args.len()))),
    }
}

fn parse_one<T: std::str::FromStr>(
    args: &[&str],
    bad: &impl Fn(String) -> ConfigError,
) -> Result<T, ConfigError> {
    parse_arg(one_arg(args, bad)?, bad)
}

fn parse_arg<T: std::str::FromStr>(
    arg: &str,
    bad: &impl Fn(String) -> ConfigError,
) -> Result<T, ConfigError> {
    arg.parse()
        .map_err(|_| bad(format!("invalid number '{arg}'")))
}

fn parse_yes_no(arg: &str, bad: &impl Fn(String) -> ConfigError) -> Result<bool, ConfigError> {
    match arg.to_ascii_lowercase().as_str() {
        "yes" => Ok(true),
        "no" => Ok(false),
        other => Err(bad(format!("expected yes or no, got '{other}'"))),
    }
}

/// Parses a byte size with optional K/KB/M/MB/G/GB suffix
/// (case insensitive; plain numbers are bytes).
fn parse_bytes(input: &str, bad: &impl Fn(String) -> ConfigError) -> Result<usize, ConfigError> {
    let upper = input.trim().to_ascii_uppercase();
    if upper.is_empty() {
        return Err(bad("empty byte size".into()));
    }
    let (num, multiplier) = if let Some(n) = upper.strip_suffix("GB") {
        (n, 1024 * 1024 * 1024)
    } else if let Some(n) = upper.strip_suffix("MB") {
        (n, 1024 * 1024)
    } else if let Some(n) = upper.strip_suffix("KB") {
        (n, 1024)
    } else if let Some(n) = upper.strip_suffix('G') {
        (n, 1024 * 1024 * 1024)
    } else if let Some(n) = upper.strip_suffix('M') {
        (n, 1024 * 1024)
    } else if let Some(n) = upper.strip_suffix('K') {
        (n, 1024)
    } else {
        (upper.as_str(), 1)
    };
    let num: usize = num
        .parse()
        .map_err(|_| bad(format!("invalid byte size '{input}'")))?;
    num.checked_mul(multiplier)
        .ok_or_else(|| bad(format!("byte size overflow '{input}'")))
}
