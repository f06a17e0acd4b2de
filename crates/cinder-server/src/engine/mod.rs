//! The executor: one task owns every database.
//!
//! Connections parse requests and write replies; everything that
//! touches the keyspace happens here, serialized through one mpsc
//! channel. That single-writer discipline is what lets the data
//! structures in cinder-core go lock-free, keeps the journal a
//! perfectly ordered history, and makes replica feeds trivially
//! consistent.
//!
//! The run loop services three sources: client commands, a 100 ms
//! periodic tick (active expiry, save points, journal fsync,
//! blocking-pop deadlines, memory pressure), and the internal event
//! channel (background save/rewrite completions, paging-job wakeups,
//! the master replication link). Parked clients — blocked pops and
//! paging waiters — hold their reply channel here until the event
//! that releases them.

pub(crate) mod blocking;
pub(crate) mod commands;
pub(crate) mod dispatch;
pub(crate) mod vm;

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use bytes::{Bytes, BytesMut};
use cinder_core::db::Storage;
use cinder_core::object::Value;
use cinder_core::{expiry, time, Keyspace, SwapPtr};
use cinder_persistence::snapshot::{self, SnapEntry, SnapValue, SnapshotError, SnapshotWriter};
use cinder_persistence::{aof, AofWriter};
use cinder_protocol::{encode_command, Reply};
use rand::seq::IteratorRandom;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::replication;

/// Client id of the journal-replay synthetic client.
const REPLAY_CLIENT: u64 = 0;

/// Server version reported by INFO.
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// How the current command entered the executor. Replayed and
/// master-fed commands bypass parking and (for replay) propagation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CallMode {
    Normal,
    Exec,
    Replay,
    Master,
}

/// What a connection gets back for one command.
#[derive(Debug)]
pub enum CommandOutcome {
    Reply(Reply),
    /// Write the reply, then close the connection (QUIT).
    ReplyThenClose(Reply),
    /// The client became a replica: forward this stream verbatim.
    ReplicaStream(mpsc::UnboundedReceiver<Bytes>),
    /// The client became a monitor: `+OK` then forward the stream.
    MonitorStream(mpsc::UnboundedReceiver<Bytes>),
}

/// Messages from connection tasks.
#[derive(Debug)]
pub enum EngineMessage {
    Register {
        id: u64,
        reply: oneshot::Sender<Result<(), Reply>>,
    },
    Command {
        client: u64,
        argv: Vec<Bytes>,
        reply: oneshot::Sender<CommandOutcome>,
    },
    Disconnect {
        client: u64,
    },
}

/// Internal completion events (background jobs, replication link).
#[derive(Debug)]
pub enum EngineEvent {
    BgSaveDone {
        result: Result<(), String>,
    },
    RewriteDone {
        result: Result<(), String>,
    },
    BulkSendDone {
        client: u64,
        ok: bool,
    },
    /// A paging worker finished a job; drain the processed queue.
    VmWake,
    /// The replica link finished downloading the master's dump.
    MasterDump {
        generation: u64,
    },
    /// One command from the master's live stream.
    MasterCommand {
        generation: u64,
        argv: Vec<Bytes>,
    },
    MasterLinkDown {
        generation: u64,
    },
}

/// What a handler produced.
pub(crate) enum HandlerResult {
    Reply(Reply),
    Close(Reply),
    /// Client parked on a blocking pop.
    Block {
        keys: Vec<Bytes>,
        deadline_ms: Option<u64>,
    },
    /// Client parked on paging loads; re-dispatched when they land.
    Parked {
        pending: usize,
    },
    Replica(mpsc::UnboundedReceiver<Bytes>),
    Monitor(mpsc::UnboundedReceiver<Bytes>),
}

/// A BLPOP/BRPOP waiter's parked reply.
pub(crate) struct BlockedState {
    pub(crate) keys: Vec<Bytes>,
    pub(crate) deadline_ms: Option<u64>,
    pub(crate) reply: oneshot::Sender<CommandOutcome>,
}

/// A paging waiter's parked command.
pub(crate) struct ParkedState {
    pub(crate) argv: Vec<Bytes>,
    pub(crate) pending: usize,
    pub(crate) reply: oneshot::Sender<CommandOutcome>,
}

/// Per-client state, owned by the executor.
pub(crate) struct ClientState {
    pub(crate) id: u64,
    pub(crate) db: usize,
    pub(crate) authenticated: bool,
    pub(crate) multi: Option<Vec<Vec<Bytes>>>,
    pub(crate) blocked: Option<BlockedState>,
    pub(crate) parked: Option<ParkedState>,
}

impl ClientState {
    fn new(id: u64) -> Self {
        Self {
            id,
            db: 0,
            authenticated: false,
            multi: None,
            blocked: None,
            parked: None,
        }
    }

    /// In-process client for replay and the master link: already
    /// authenticated, never parked.
    fn synthetic(id: u64) -> Self {
        Self {
            authenticated: true,
            ..Self::new(id)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplicaState {
    /// Waiting for the next background save to start.
    WaitStart,
    /// A background save that will serve this replica is running.
    WaitEnd,
    /// The dump file is streaming to the replica.
    SendBulk,
    /// Live: mutations flow directly.
    Online,
}

/// Master-side record of one connected replica.
struct Replica {
    state: ReplicaState,
    tx: mpsc::UnboundedSender<Bytes>,
    /// Mutations accumulated while the dump is prepared/streamed.
    pending: BytesMut,
    /// Last database selected on this replica's stream.
    last_db: Option<usize>,
}

/// Replica-side view of our master, when we are one.
struct MasterInfo {
    host: String,
    port: u16,
    link_up: bool,
}

struct BgSaveState {
    dirty_at_start: u64,
}

struct RewriteState {
    tmp: PathBuf,
    /// Post-t₀ mutations to append to the rewritten journal.
    diff: BytesMut,
    last_db: Option<usize>,
}

pub struct Engine {
    pub(crate) config: Arc<Config>,
    pub(crate) keyspace: Keyspace,
    pub(crate) clients: AHashMap<u64, ClientState>,
    /// Per-db: key → FIFO of clients blocked on a push.
    pub(crate) blocked_keys: Vec<AHashMap<Bytes, VecDeque<u64>>>,
    /// Per-db: key → clients waiting for a page load.
    pub(crate) loading_keys: Vec<AHashMap<Bytes, Vec<u64>>>,
    pub(crate) vm: Option<vm::Vm>,
    pub(crate) aof: Option<AofWriter>,
    rewrite: Option<RewriteState>,
    bgsave: Option<BgSaveState>,
    replicas: AHashMap<u64, Replica>,
    monitors: AHashMap<u64, mpsc::UnboundedSender<Bytes>>,
    master: Option<MasterInfo>,
    master_client: Option<ClientState>,
    replica_task: Option<JoinHandle<()>>,
    repl_generation: u64,
    pub(crate) call_mode: CallMode,
    pub(crate) propagate_override: Option<Vec<Vec<Bytes>>>,
    /// Cumulative mutation counter (drives propagation detection).
    pub(crate) dirty: u64,
    dirty_since_save: u64,
    pub(crate) last_save_secs: u64,
    start_secs: u64,
    connected_clients: usize,
    total_connections: u64,
    pub(crate) total_commands: u64,
    evicted_keys: u64,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
}

/// Cloneable sender half used by connection tasks.
#[derive(Clone)]
pub struct EngineHandle {
    pub tx: mpsc::Sender<EngineMessage>,
}

impl Engine {
    pub fn new(
        config: Arc<Config>,
        events_tx: mpsc::UnboundedSender<EngineEvent>,
    ) -> anyhow::Result<Engine> {
        let keyspace = Keyspace::new(config.databases);
        let aof = if config.appendonly {
            Some(AofWriter::open(config.aof_path(), config.appendfsync)?)
        } else {
            None
        };
        let vm = match &config.vm {
            Some(vm_cfg) => Some(vm::Vm::start(vm_cfg, events_tx.clone())?),
            None => None,
        };
        let databases = config.databases;
        Ok(Engine {
            config,
            keyspace,
            clients: AHashMap::new(),
            blocked_keys: (0..databases).map(|_| AHashMap::new()).collect(),
            loading_keys: (0..databases).map(|_| AHashMap::new()).collect(),
            vm,
            aof,
            rewrite: None,
            bgsave: None,
            replicas: AHashMap::new(),
            monitors: AHashMap::new(),
            master: None,
            master_client: None,
            replica_task: None,
            repl_generation: 0,
            call_mode: CallMode::Normal,
            propagate_override: None,
            dirty: 0,
            dirty_since_save: 0,
            last_save_secs: time::now_secs(),
            start_secs: time::now_secs(),
            connected_clients: 0,
            total_connections: 0,
            total_commands: 0,
            evicted_keys: 0,
            events_tx,
        })
    }

    /// Startup recovery: replay the journal when append-only mode is
    /// on, otherwise load the snapshot if one exists.
    pub fn load_data(&mut self) -> anyhow::Result<()> {
        let aof_path = self.config.aof_path();
        let db_path = self.config.db_path();

        if self.config.appendonly
            && aof_path.exists()
            && std::fs::metadata(&aof_path)?.len() > 0
        {
            let mut client = ClientState::synthetic(REPLAY_CLIENT);
            self.call_mode = CallMode::Replay;
            let applied = aof::replay(&aof_path, |argv| {
                let _ = dispatch::execute(self, &mut client, &argv);
            })?;
            self.call_mode = CallMode::Normal;
            info!(commands = applied, "journal replayed");
        } else if db_path.exists() {
            let entries = snapshot::load(&db_path)?;
            let count = entries.len();
            for entry in entries {
                self.restore_entry(entry);
            }
            info!(keys = count, "snapshot loaded");
        }

        self.dirty = 0;
        self.dirty_since_save = 0;
        self.total_commands = 0;
        Ok(())
    }

    /// Connects to the configured master, if any.
    pub fn start_initial_replication(&mut self) {
        if let Some((host, port)) = self.config.slaveof.clone() {
            self.set_master(Some((host, port)));
        }
    }

    // -- message handling ---------------------------------------------------

    fn handle_message(&mut self, msg: EngineMessage) {
        match msg {
            EngineMessage::Register { id, reply } => {
                if self.config.maxclients != 0 && self.connected_clients >= self.config.maxclients
                {
                    let _ = reply.send(Err(Reply::error("max number of clients reached")));
                    return;
                }
                self.clients.insert(id, ClientState::new(id));
                self.connected_clients += 1;
                self.total_connections += 1;
                let _ = reply.send(Ok(()));
            }
            EngineMessage::Command {
                client,
                argv,
                reply,
            } => self.process_command(client, argv, reply),
            EngineMessage::Disconnect { client } => self.remove_client(client),
        }
    }

    fn process_command(
        &mut self,
        client_id: u64,
        argv: Vec<Bytes>,
        reply: oneshot::Sender<CommandOutcome>,
    ) {
        if argv.is_empty() {
            let _ = reply.send(CommandOutcome::Reply(Reply::error("empty command")));
            return;
        }
        let Some(mut client) = self.clients.remove(&client_id) else {
            return; // raced with a disconnect
        };
        self.call_mode = CallMode::Normal;
        let result = dispatch::execute(self, &mut client, &argv);
        self.settle(&mut client, argv, result, reply);
        self.clients.insert(client_id, client);
    }

    fn settle(
        &mut self,
        client: &mut ClientState,
        argv: Vec<Bytes>,
        result: HandlerResult,
        reply: oneshot::Sender<CommandOutcome>,
    ) {
        match result {
            HandlerResult::Reply(r) => {
                let _ = reply.send(CommandOutcome::Reply(r));
            }
            HandlerResult::Close(r) => {
                let _ = reply.send(CommandOutcome::ReplyThenClose(r));
            }
            HandlerResult::Block { keys, deadline_ms } => {
                client.blocked = Some(BlockedState {
                    keys,
                    deadline_ms,
                    reply,
                });
            }
            HandlerResult::Parked { pending } => {
                client.parked = Some(ParkedState {
                    argv,
                    pending,
                    reply,
                });
            }
            HandlerResult::Replica(rx) => {
                let _ = reply.send(CommandOutcome::ReplicaStream(rx));
            }
            HandlerResult::Monitor(rx) => {
                let _ = reply.send(CommandOutcome::MonitorStream(rx));
            }
        }
    }

    fn remove_client(&mut self, client_id: u64) {
        if let Some(client) = self.clients.remove(&client_id) {
            self.connected_clients = self.connected_clients.saturating_sub(1);
            if let Some(blocked) = client.blocked {
                blocking::clear_registrations(self, client.db, client_id, &blocked.keys);
            }
            if client.parked.is_some() {
                for waiters in self.loading_keys[client.db].values_mut() {
                    waiters.retain(|&id| id != client_id);
                }
            }
        }
        self.replicas.remove(&client_id);
        self.monitors.remove(&client_id);
    }

    // -- events -------------------------------------------------------------

    fn handle_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::BgSaveDone { result } => self.on_bgsave_done(result),
            EngineEvent::RewriteDone { result } => self.on_rewrite_done(result),
            EngineEvent::BulkSendDone { client, ok } => self.on_bulk_send_done(client, ok),
            EngineEvent::VmWake => {
                let jobs = match self.vm.as_mut() {
                    Some(vm) => vm.drain_processed(),
                    None => Vec::new(),
                };
                for job in jobs {
                    self.commit_vm_job(job);
                }
            }
            EngineEvent::MasterDump { generation } => self.on_master_dump(generation),
            EngineEvent::MasterCommand { generation, argv } => {
                self.on_master_command(generation, argv)
            }
            EngineEvent::MasterLinkDown { generation } => {
                if generation == self.repl_generation {
                    if let Some(master) = self.master.as_mut() {
                        if master.link_up {
                            warn!("MASTER <-> REPLICA link lost, will reconnect");
                        }
                        master.link_up = false;
                    }
                }
            }
        }
    }

    // -- cron ---------------------------------------------------------------

    fn cron(&mut self) {
        let removed = expiry::run_cycle(&mut self.keyspace);
        if removed > 0 {
            debug!(removed, "active expiry cycle");
        }
        blocking::unblock_expired(self);
        if let Some(aof) = self.aof.as_mut() {
            if let Err(e) = aof.fsync_if_due() {
                error!("journal fsync failed: {e}");
            }
        }
        self.check_save_points();
        self.evict_for_maxmemory();
        self.maybe_swap_out();
    }

    fn check_save_points(&mut self) {
        if self.bgsave.is_some() {
            return;
        }
        let elapsed = time::now_secs().saturating_sub(self.last_save_secs);
        let due = self
            .config
            .save_points
            .iter()
            .any(|&(secs, changes)| elapsed >= secs && self.dirty_since_save >= changes);
        if due {
            info!(
                changes = self.dirty_since_save,
                elapsed, "save point reached, starting background save"
            );
            self.start_bgsave();
        }
    }

    // -- dirty tracking & propagation --------------------------------------

    pub(crate) fn add_dirty(&mut self, n: u64) {
        self.dirty += n;
        self.dirty_since_save += n;
    }

    /// Sends executed mutation frames to the journal, the rewrite
    /// diff buffer and every fed replica.
    pub(crate) fn propagate(&mut self, db: usize, frames: &[Vec<Bytes>]) {
        for frame in frames {
            if let Some(aof) = self.aof.as_mut() {
                if let Err(e) = aof.append(db as u32, frame) {
                    error!("journal append failed: {e}");
                }
            }
            if let Some(rw) = self.rewrite.as_mut() {
                if rw.last_db != Some(db) {
                    encode_select(&mut rw.diff, db);
                    rw.last_db = Some(db);
                }
                encode_command(&mut rw.diff, frame);
            }
            self.feed_replicas(db, frame);
        }
    }

    fn feed_replicas(&mut self, db: usize, argv: &[Bytes]) {
        let mut scratch = BytesMut::new();
        for replica in self.replicas.values_mut() {
            match replica.state {
                ReplicaState::WaitStart => {}
                ReplicaState::WaitEnd | ReplicaState::SendBulk => {
                    if replica.last_db != Some(db) {
                        encode_select(&mut replica.pending, db);
                        replica.last_db = Some(db);
                    }
                    encode_command(&mut replica.pending, argv);
                }
                ReplicaState::Online => {
                    scratch.clear();
                    if replica.last_db != Some(db) {
                        encode_select(&mut scratch, db);
                        replica.last_db = Some(db);
                    }
                    encode_command(&mut scratch, argv);
                    let _ = replica.tx.send(scratch.split().freeze());
                }
            }
        }
    }

    pub(crate) fn feed_monitors(
        &mut self,
        db: usize,
        spec: &dispatch::CommandSpec,
        argv: &[Bytes],
    ) {
        if self.monitors.is_empty() || self.call_mode == CallMode::Replay || spec.name == "AUTH" {
            return;
        }
        let now = time::now_ms();
        let mut line = format!("+{}.{:03} (db {})", now / 1000, now % 1000, db);
        for arg in argv {
            line.push_str(" \"");
            line.push_str(&String::from_utf8_lossy(arg).escape_default().to_string());
            line.push('"');
        }
        line.push_str("\r\n");
        let payload = Bytes::from(line);
        self.monitors.retain(|_, tx| tx.send(payload.clone()).is_ok());
    }

    pub(crate) fn register_monitor(&mut self, client_id: u64) -> mpsc::UnboundedReceiver<Bytes> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.monitors.insert(client_id, tx);
        info!(client = client_id, "monitor attached");
        rx
    }

    // -- maxmemory ----------------------------------------------------------

    pub(crate) fn over_maxmemory(&self) -> bool {
        self.config.maxmemory != 0 && self.keyspace.value_bytes() > self.config.maxmemory
    }

    /// Frees memory by evicting the soonest-to-expire key among a
    /// small sample of volatile keys per database.
    fn evict_for_maxmemory(&mut self) {
        if self.config.maxmemory == 0 {
            return;
        }
        while self.keyspace.value_bytes() > self.config.maxmemory {
            let mut victim: Option<(u64, usize, Bytes)> = None;
            for (idx, db) in self.keyspace.dbs().iter().enumerate() {
                for key in db.sample_expires(3) {
                    let Some(at) = db.expire_at(&key) else { continue };
                    if victim.as_ref().is_none_or(|(best, ..)| at < *best) {
                        victim = Some((at, idx, key));
                    }
                }
            }
            match victim {
                Some((_, idx, key)) => {
                    self.keyspace.db_mut(idx).remove(&key);
                    self.evicted_keys += 1;
                }
                None => break, // nothing volatile left to shed
            }
        }
    }

    // -- snapshot & journal background jobs ---------------------------------

    pub(crate) fn bgsave_in_progress(&self) -> bool {
        self.bgsave.is_some()
    }

    pub(crate) fn rewrite_in_progress(&self) -> bool {
        self.rewrite.is_some()
    }

    /// Snapshots the keyspace into exchange entries. Swapped values
    /// are read back from the swap file.
    fn collect_entries(&self) -> std::io::Result<Vec<SnapEntry>> {
        let now = time::now_ms();
        let mut entries = Vec::with_capacity(self.keyspace.total_keys());
        for (idx, db) in self.keyspace.dbs().iter().enumerate() {
            for (key, entry) in db.entries.iter() {
                let expire_at_secs = match db.expires.get(key) {
                    Some(&at) if at <= now => continue, // logically gone
                    Some(&at) => Some((at / 1000) as i64),
                    None => None,
                };
                let value = match &entry.storage {
                    Storage::Memory(v) | Storage::Swapping(v) => snap_value(v),
                    Storage::Swapped(ptr) | Storage::Loading(ptr) => {
                        let vm = self.vm.as_ref().expect("swapped entries imply paging");
                        SnapValue::Str(vm.read_direct(*ptr)?)
                    }
                };
                entries.push(SnapEntry {
                    db: idx as u32,
                    key: key.clone(),
                    value,
                    expire_at_secs,
                });
            }
        }
        Ok(entries)
    }

    /// Writes the snapshot inline (SAVE, SHUTDOWN, DEBUG RELOAD).
    pub(crate) fn foreground_save(&mut self) -> Result<(), SnapshotError> {
        let entries = self.collect_entries()?;
        write_snapshot(&self.config.db_path(), self.config.rdbcompression, &entries)?;
        self.last_save_secs = time::now_secs();
        self.dirty_since_save = 0;
        info!("DB saved on disk");
        Ok(())
    }

    /// Kicks off a background save. The keyspace is captured now
    /// (string payloads are shared, collections cloned); a blocking
    /// task writes, fsyncs and renames while the executor keeps
    /// serving writes.
    pub(crate) fn start_bgsave(&mut self) -> bool {
        if self.bgsave.is_some() {
            return false;
        }
        let entries = match self.collect_entries() {
            Ok(entries) => entries,
            Err(e) => {
                error!("cannot capture keyspace for background save: {e}");
                return false;
            }
        };
        self.bgsave = Some(BgSaveState {
            dirty_at_start: self.dirty_since_save,
        });
        let path = self.config.db_path();
        let compression = self.config.rdbcompression;
        let events = self.events_tx.clone();
        info!("background saving started");
        tokio::task::spawn_blocking(move || {
            let result =
                write_snapshot(&path, compression, &entries).map_err(|e| e.to_string());
            let _ = events.send(EngineEvent::BgSaveDone { result });
        });
        true
    }

    fn on_bgsave_done(&mut self, result: Result<(), String>) {
        let state = self.bgsave.take();
        match result {
            Ok(()) => {
                self.last_save_secs = time::now_secs();
                if let Some(state) = state {
                    self.dirty_since_save =
                        self.dirty_since_save.saturating_sub(state.dirty_at_start);
                }
                info!("background saving terminated with success");
                let ready: Vec<u64> = self
                    .replicas
                    .iter()
                    .filter(|(_, r)| r.state == ReplicaState::WaitEnd)
                    .map(|(&id, _)| id)
                    .collect();
                for id in ready {
                    self.start_bulk_send(id);
                }
            }
            Err(e) => {
                error!("background saving error: {e}");
                let failed: Vec<u64> = self
                    .replicas
                    .iter()
                    .filter(|(_, r)| r.state == ReplicaState::WaitEnd)
                    .map(|(&id, _)| id)
                    .collect();
                for id in failed {
                    warn!(replica = id, "disconnecting replica after failed save");
                    self.replicas.remove(&id);
                }
            }
        }

        // replicas that arrived mid-save get their own cycle
        let queued = self
            .replicas
            .values()
            .any(|r| r.state == ReplicaState::WaitStart);
        if queued && self.start_bgsave() {
            for replica in self.replicas.values_mut() {
                if replica.state == ReplicaState::WaitStart {
                    replica.state = ReplicaState::WaitEnd;
                }
            }
        }
    }

    fn start_bulk_send(&mut self, client_id: u64) {
        let Some(replica) = self.replicas.get_mut(&client_id) else {
            return;
        };
        replica.state = ReplicaState::SendBulk;
        let tx = replica.tx.clone();
        let path = self.config.db_path();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let ok = replication::stream_dump(&path, &tx).await.is_ok();
            let _ = events.send(EngineEvent::BulkSendDone {
                client: client_id,
                ok,
            });
        });
    }

    fn on_bulk_send_done(&mut self, client_id: u64, ok: bool) {
        if !ok {
            warn!(replica = client_id, "dump streaming failed, dropping replica");
            self.replicas.remove(&client_id);
            return;
        }
        if let Some(replica) = self.replicas.get_mut(&client_id) {
            let pending = replica.pending.split().freeze();
            if !pending.is_empty() {
                let _ = replica.tx.send(pending);
            }
            replica.state = ReplicaState::Online;
            info!(replica = client_id, "synchronization with replica succeeded");
        }
    }

    /// Registers a SYNCing client per the full-sync state machine.
    pub(crate) fn register_replica(&mut self, client_id: u64) -> mpsc::UnboundedReceiver<Bytes> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut replica = Replica {
            state: ReplicaState::WaitStart,
            tx,
            pending: BytesMut::new(),
            last_db: None,
        };

        if self.bgsave.is_some() {
            // piggyback on a WaitEnd replica's accumulated stream if
            // one exists; otherwise queue for the next cycle
            if let Some(other) = self
                .replicas
                .values()
                .find(|r| r.state == ReplicaState::WaitEnd)
            {
                replica.pending = other.pending.clone();
                replica.last_db = other.last_db;
                replica.state = ReplicaState::WaitEnd;
                info!(replica = client_id, "SYNC: joining in-progress background save");
            } else {
                info!(replica = client_id, "SYNC: queued for next background save");
            }
        } else {
            self.start_bgsave();
            replica.state = ReplicaState::WaitEnd;
            info!(replica = client_id, "SYNC: background save started for full sync");
        }

        self.replicas.insert(client_id, replica);
        rx
    }

    pub(crate) fn start_rewrite(&mut self) -> bool {
        if self.rewrite.is_some() {
            return false;
        }
        let entries = match self.collect_entries() {
            Ok(entries) => entries,
            Err(e) => {
                error!("cannot capture keyspace for journal rewrite: {e}");
                return false;
            }
        };
        let tmp = self
            .config
            .dir
            .join(format!("temp-rewrite-{}.aof", std::process::id()));
        self.rewrite = Some(RewriteState {
            tmp: tmp.clone(),
            diff: BytesMut::new(),
            last_db: None,
        });
        let events = self.events_tx.clone();
        info!("background journal rewrite started");
        tokio::task::spawn_blocking(move || {
            let result = aof::write_rewrite(&tmp, &entries).map_err(|e| e.to_string());
            let _ = events.send(EngineEvent::RewriteDone { result });
        });
        true
    }

    fn on_rewrite_done(&mut self, result: Result<(), String>) {
        let Some(state) = self.rewrite.take() else {
            return;
        };
        match result {
            Ok(()) => {
                let live = self.config.aof_path();
                if let Err(e) = aof::install_rewrite(&state.tmp, &live, &state.diff) {
                    error!("installing rewritten journal failed: {e}");
                    let _ = std::fs::remove_file(&state.tmp);
                    return;
                }
                if let Some(aof) = self.aof.as_mut() {
                    if let Err(e) = aof.reopen() {
                        error!("reopening journal after rewrite failed: {e}");
                    }
                }
                info!("background journal rewrite finished");
            }
            Err(e) => {
                error!("background journal rewrite failed: {e}");
                let _ = std::fs::remove_file(&state.tmp);
            }
        }
    }

    // -- replication (replica side) -----------------------------------------

    pub(crate) fn set_master(&mut self, target: Option<(String, u16)>) {
        self.repl_generation += 1;
        if let Some(task) = self.replica_task.take() {
            task.abort();
        }
        self.master = None;
        self.master_client = None;

        if let Some((host, port)) = target {
            info!(%host, port, "becoming replica of master");
            let task = replication::spawn_replica_link(
                host.clone(),
                port,
                self.config.masterauth.clone(),
                self.config.db_path(),
                self.repl_generation,
                self.events_tx.clone(),
            );
            self.replica_task = Some(task);
            self.master = Some(MasterInfo {
                host,
                port,
                link_up: false,
            });
        } else {
            info!("master mode enabled");
        }
    }

    fn on_master_dump(&mut self, generation: u64) {
        if generation != self.repl_generation {
            return;
        }
        for idx in 0..self.keyspace.db_count() {
            self.release_swapped_pages(idx);
        }
        self.keyspace.clear_all();
        match snapshot::load(&self.config.db_path()) {
            Ok(entries) => {
                let count = entries.len();
                for entry in entries {
                    self.restore_entry(entry);
                }
                if let Some(master) = self.master.as_mut() {
                    master.link_up = true;
                }
                info!(keys = count, "MASTER <-> REPLICA sync finished with success");
            }
            Err(e) => error!("loading master dump failed: {e}"),
        }
    }

    fn on_master_command(&mut self, generation: u64, argv: Vec<Bytes>) {
        if generation != self.repl_generation || argv.is_empty() {
            return;
        }
        let mut client = self
            .master_client
            .take()
            .unwrap_or_else(|| ClientState::synthetic(u64::MAX));
        self.call_mode = CallMode::Master;
        let _ = dispatch::execute(self, &mut client, &argv);
        self.call_mode = CallMode::Normal;
        self.master_client = Some(client);
    }

    // -- value paging -------------------------------------------------------

    /// Pre-execution gate: queues loads for the command's swapped
    /// keys. Returns the number of loads the client must wait for
    /// (0 = run now). Synthetic callers load synchronously.
    pub(crate) fn preload_gate(
        &mut self,
        client: &mut ClientState,
        spec: &dispatch::CommandSpec,
        argv: &[Bytes],
    ) -> usize {
        let indices = dispatch::key_indices(spec, argv.len());
        if self.call_mode != CallMode::Normal {
            for idx in indices {
                self.load_key_now(client.db, &argv[idx]);
            }
            return 0;
        }

        let db_idx = client.db;
        let mut pending = 0;
        for idx in indices {
            let key = &argv[idx];
            enum Gate {
                Ready,
                CancelSwap,
                StartLoad(SwapPtr),
                AwaitLoad,
            }
            let gate = match self.keyspace.db_mut(db_idx).entries.get(key) {
                None => Gate::Ready,
                Some(entry) => match &entry.storage {
                    Storage::Memory(_) => Gate::Ready,
                    Storage::Swapping(_) => Gate::CancelSwap,
                    Storage::Swapped(ptr) => Gate::StartLoad(*ptr),
                    Storage::Loading(_) => Gate::AwaitLoad,
                },
            };
            match gate {
                Gate::Ready => {}
                Gate::CancelSwap => self.cancel_vm_job(db_idx, key),
                Gate::StartLoad(ptr) => {
                    if let Some(entry) = self.keyspace.db_mut(db_idx).entries.get_mut(key) {
                        entry.storage = Storage::Loading(ptr);
                    }
                    self.vm
                        .as_mut()
                        .expect("gate only runs with paging on")
                        .queue_load(db_idx, key.clone(), ptr);
                    self.park_on_load(db_idx, key, client.id);
                    pending += 1;
                }
                Gate::AwaitLoad => {
                    self.park_on_load(db_idx, key, client.id);
                    pending += 1;
                }
            }
        }
        pending
    }

    fn park_on_load(&mut self, db_idx: usize, key: &Bytes, client_id: u64) {
        let waiters = self.loading_keys[db_idx].entry(key.clone()).or_default();
        if !waiters.contains(&client_id) {
            waiters.push(client_id);
        }
    }

    /// Blocking load for paths outside the preload gate (SORT BY/GET
    /// references, synthetic clients).
    pub(crate) fn load_key_now(&mut self, db_idx: usize, key: &[u8]) {
        if self.vm.is_none() {
            return;
        }
        enum S {
            Swapping,
            Swapped(SwapPtr),
            Loading,
        }
        let state = match self.keyspace.db_mut(db_idx).entries.get(key) {
            None => return,
            Some(entry) => match &entry.storage {
                Storage::Memory(_) => return,
                Storage::Swapping(_) => S::Swapping,
                Storage::Swapped(ptr) => S::Swapped(*ptr),
                Storage::Loading(_) => S::Loading,
            },
        };
        match state {
            S::Swapping => self.cancel_vm_job(db_idx, key),
            S::Swapped(ptr) => self.install_from_disk(db_idx, key, ptr),
            S::Loading => {
                // wait the in-flight load out, then read directly
                self.cancel_vm_job(db_idx, key); // reverts to Swapped
                let ptr = match self.keyspace.db_mut(db_idx).entries.get(key).map(|e| &e.storage)
                {
                    Some(Storage::Swapped(ptr)) => Some(*ptr),
                    _ => None,
                };
                if let Some(ptr) = ptr {
                    self.install_from_disk(db_idx, key, ptr);
                }
            }
        }
    }

    fn install_from_disk(&mut self, db_idx: usize, key: &[u8], ptr: SwapPtr) {
        let Some(vm) = self.vm.as_mut() else { return };
        match vm.read_direct(ptr) {
            Ok(data) => {
                vm.free_pages(ptr);
                vm.swapped_keys = vm.swapped_keys.saturating_sub(1);
                vm.swap_ins += 1;
                let db = self.keyspace.db_mut(db_idx);
                if let Some(entry) = db.entries.get_mut(key) {
                    entry.storage = Storage::Memory(Value::str(data));
                }
                db.refresh_size(key);
            }
            Err(e) => error!(key = ?Bytes::copy_from_slice(key), "swap read failed: {e}"),
        }
    }

    /// Cancels the in-flight paging job on a key and reverts its
    /// storage tag (Swapping → Memory, Loading → Swapped).
    pub(crate) fn cancel_vm_job(&mut self, db_idx: usize, key: &[u8]) {
        let Some(vm) = self.vm.as_mut() else { return };
        if let Some(job) = vm.cancel(db_idx, key) {
            if job.kind == vm::JobKind::DoSwap {
                if let Some(ptr) = job.ptr {
                    vm.free_pages(ptr);
                }
            }
        }
        if let Some(entry) = self.keyspace.db_mut(db_idx).entries.get_mut(key) {
            entry.storage.cancel_transfer();
        }
    }

    fn commit_vm_job(&mut self, mut job: vm::Job) {
        let Some(mut vm) = self.vm.take() else { return };
        let mut resume: Vec<u64> = Vec::new();

        match job.kind {
            vm::JobKind::PrepareSwap => {
                if job.canceled || job.error.is_some() {
                    vm.job_committed(&job);
                } else {
                    match vm.alloc_pages(job.pages) {
                        Some(page) => {
                            let pages = job.pages;
                            vm.requeue_as_swap(job, SwapPtr { page, pages });
                            self.vm = Some(vm);
                            return;
                        }
                        None => {
                            warn!("swap file is full, aborting swap-out");
                            job.error = Some("swap file full".into());
                            vm.job_committed(&job);
                            if let Some(entry) =
                                self.keyspace.db_mut(job.db).entries.get_mut(&job.key)
                            {
                                entry.storage.cancel_transfer();
                            }
                        }
                    }
                }
            }
            vm::JobKind::DoSwap => {
                vm.job_committed(&job);
                if job.canceled || job.error.is_some() {
                    if let Some(ptr) = job.ptr {
                        vm.free_pages(ptr);
                    }
                    if !job.canceled {
                        // write failed: the payload is still resident
                        if let Some(entry) =
                            self.keyspace.db_mut(job.db).entries.get_mut(&job.key)
                        {
                            entry.storage.cancel_transfer();
                        }
                    }
                } else {
                    let ptr = job.ptr.expect("DoSwap carries its pages");
                    let db = self.keyspace.db_mut(job.db);
                    if let Some(entry) = db.entries.get_mut(&job.key) {
                        if matches!(entry.storage, Storage::Swapping(_)) {
                            entry.storage = Storage::Swapped(ptr);
                            vm.swapped_keys += 1;
                            vm.swap_outs += 1;
                            db.refresh_size(&job.key);
                            debug!(key = ?job.key, pages = ptr.pages, "value swapped out");
                        } else {
                            // key mutated underneath: the copy on disk
                            // is stale
                            vm.free_pages(ptr);
                        }
                    } else {
                        vm.free_pages(ptr);
                    }
                }
            }
            vm::JobKind::Load => {
                vm.job_committed(&job);
                if !job.canceled {
                    let db = self.keyspace.db_mut(job.db);
                    match (job.error.take(), job.loaded.take()) {
                        (None, Some(data)) => {
                            if let Some(entry) = db.entries.get_mut(&job.key) {
                                if let Storage::Loading(ptr) = entry.storage {
                                    entry.storage = Storage::Memory(Value::str(data));
                                    vm.free_pages(ptr);
                                    vm.swapped_keys = vm.swapped_keys.saturating_sub(1);
                                    vm.swap_ins += 1;
                                    db.refresh_size(&job.key);
                                }
                            }
                        }
                        _ => {
                            // leave the value on disk; waiters retry
                            // through the gate
                            if let Some(entry) = db.entries.get_mut(&job.key) {
                                entry.storage.cancel_transfer();
                            }
                        }
                    }
                    if let Some(waiters) = self.loading_keys[job.db].remove(&job.key) {
                        resume = waiters;
                    }
                }
            }
        }

        self.vm = Some(vm);
        for client_id in resume {
            self.resume_client(client_id);
        }
    }

    /// Re-dispatches a parked client whose awaited key finished
    /// loading. The command goes through the full gate again, so it
    /// re-parks if another of its keys got swapped out meanwhile.
    fn resume_client(&mut self, client_id: u64) {
        let Some(mut client) = self.clients.remove(&client_id) else {
            return;
        };
        let Some(parked) = client.parked.take() else {
            self.clients.insert(client_id, client);
            return;
        };

        if parked.pending > 1 {
            client.parked = Some(ParkedState {
                pending: parked.pending - 1,
                ..parked
            });
            self.clients.insert(client_id, client);
            return;
        }

        self.call_mode = CallMode::Normal;
        let argv = parked.argv;
        let result = dispatch::execute(self, &mut client, &argv);
        self.settle(&mut client, argv, result, parked.reply);
        self.clients.insert(client_id, client);
    }

    /// Decides whether resident values should be paged out, and
    /// queues swap jobs for the best candidates.
    fn maybe_swap_out(&mut self) {
        let Some(vm) = self.vm.as_ref() else { return };
        let max = vm.max_memory;
        let mut projected = self.keyspace.value_bytes();
        if projected <= max {
            return;
        }

        while projected > max {
            if self
                .vm
                .as_ref()
                .expect("paging checked above")
                .inflight_swaps()
                >= vm::MAX_INFLIGHT_SWAPS
            {
                break;
            }
            let Some((db_idx, key, size)) = self.pick_swap_candidate() else {
                break;
            };
            let payload = {
                let db = self.keyspace.db_mut(db_idx);
                let Some(entry) = db.entries.get_mut(&key) else { continue };
                let Storage::Memory(Value::Str(s)) = &entry.storage else {
                    continue;
                };
                let payload = s.as_bytes();
                entry.storage.begin_swap();
                payload
            };
            debug!(key = ?key, bytes = size, "queueing swap-out");
            self.vm
                .as_mut()
                .expect("paging checked above")
                .queue_swap_out(db_idx, key, payload);
            projected = projected.saturating_sub(size);
        }
    }

    /// Samples keys across all databases and scores them by
    /// `idle_age × ln(1 + size)`; only resident string values
    /// without an in-flight job are eligible.
    fn pick_swap_candidate(&mut self) -> Option<(usize, Bytes, usize)> {
        let now = time::now_ms();
        let mut rng = rand::rng();
        let mut best: Option<(f64, usize, Bytes, usize)> = None;

        for (idx, db) in self.keyspace.dbs().iter().enumerate() {
            for (key, entry) in db.entries.iter().choose_multiple(&mut rng, 5) {
                if !matches!(entry.storage, Storage::Memory(Value::Str(_))) {
                    continue;
                }
                if self
                    .vm
                    .as_ref()
                    .is_some_and(|vm| vm.has_job(idx, key))
                {
                    continue;
                }
                let size = entry.cached_size.max(1);
                let idle_secs =
                    now.saturating_sub(entry.last_access_ms) as f64 / 1000.0 + 1.0;
                let score = idle_secs * (1.0 + size as f64).ln();
                if best.as_ref().is_none_or(|(s, ..)| score > *s) {
                    best = Some((score, idx, key.clone(), size));
                }
            }
        }
        best.map(|(_, idx, key, size)| (idx, key, size))
    }

    /// Cancels jobs and frees swap pages for every paged entry of a
    /// database. Used before FLUSHDB/FLUSHALL and dump loads.
    pub(crate) fn release_swapped_pages(&mut self, db_idx: usize) {
        if self.vm.is_none() {
            return;
        }
        let paged: Vec<Bytes> = self
            .keyspace
            .db(db_idx)
            .entries
            .iter()
            .filter(|(_, e)| !matches!(e.storage, Storage::Memory(_)))
            .map(|(key, _)| key.clone())
            .collect();

        for key in paged {
            self.cancel_vm_job(db_idx, &key);
            let ptr = match self.keyspace.db(db_idx).entries.get(&key).map(|e| &e.storage) {
                Some(Storage::Swapped(ptr)) => Some(*ptr),
                _ => None,
            };
            if let Some(ptr) = ptr {
                let vm = self.vm.as_mut().expect("paging checked above");
                vm.free_pages(ptr);
                vm.swapped_keys = vm.swapped_keys.saturating_sub(1);
            }
        }
    }

    // -- startup restore & reload -------------------------------------------

    fn restore_entry(&mut self, entry: SnapEntry) {
        if entry.expire_at_secs.is_some_and(|at| at <= time::now_secs() as i64) {
            return; // expired while on disk
        }
        let db_idx = entry.db as usize;
        if db_idx >= self.keyspace.db_count() {
            warn!(db = entry.db, "snapshot entry for unconfigured database, skipped");
            return;
        }

        let value = match entry.value {
            SnapValue::Str(data) => Value::str(data),
            SnapValue::List(items) => Value::List(items.into_iter().collect()),
            SnapValue::Set(members) => Value::Set(members.into_iter().collect()),
            SnapValue::Zset(members) => {
                let mut zset = cinder_core::SortedSet::new();
                for (member, score) in members {
                    let _ = zset.upsert(member, score, false);
                }
                Value::Zset(zset)
            }
            SnapValue::Hash(fields) => {
                let mut hash = cinder_core::Hash::new();
                for (field, value) in fields {
                    hash.set(
                        field,
                        value,
                        self.config.hash_max_zipmap_entries,
                        self.config.hash_max_zipmap_value,
                    );
                }
                Value::Hash(hash)
            }
        };

        let db = self.keyspace.db_mut(db_idx);
        db.insert_new(entry.key.clone(), value);
        if let Some(at) = entry.expire_at_secs {
            db.set_expire(&entry.key, at as u64 * 1000);
        }
        db.refresh_size(&entry.key);
    }

    /// DEBUG RELOAD: save, drop everything, load it back.
    pub(crate) fn debug_reload(&mut self) -> Result<(), SnapshotError> {
        self.foreground_save()?;
        for idx in 0..self.keyspace.db_count() {
            self.release_swapped_pages(idx);
        }
        self.keyspace.clear_all();
        let entries = snapshot::load(&self.config.db_path())?;
        for entry in entries {
            self.restore_entry(entry);
        }
        Ok(())
    }

    // -- INFO ---------------------------------------------------------------

    pub(crate) fn info_text(&self) -> String {
        let uptime = time::now_secs().saturating_sub(self.start_secs);
        let role = if self.master.is_some() { "slave" } else { "master" };
        let mut text = format!(
            "version:{VERSION}\r\n\
             uptime_in_seconds:{uptime}\r\n\
             connected_clients:{}\r\n\
             connected_slaves:{}\r\n\
             used_memory:{}\r\n\
             changes_since_last_save:{}\r\n\
             bgsave_in_progress:{}\r\n\
             last_save_time:{}\r\n\
             bgrewriteaof_in_progress:{}\r\n\
             total_connections_received:{}\r\n\
             total_commands_processed:{}\r\n\
             expired_keys:{}\r\n\
             evicted_keys:{}\r\n\
             role:{role}\r\n",
            self.connected_clients,
            self.replicas
                .values()
                .filter(|r| r.state == ReplicaState::Online)
                .count(),
            self.keyspace.value_bytes(),
            self.dirty_since_save,
            u8::from(self.bgsave.is_some()),
            self.last_save_secs,
            u8::from(self.rewrite.is_some()),
            self.total_connections,
            self.total_commands,
            self.keyspace.dbs().iter().map(|db| db.expired_total).sum::<u64>(),
            self.evicted_keys,
        );
        if let Some(master) = &self.master {
            text.push_str(&format!(
                "master_host:{}\r\nmaster_port:{}\r\nmaster_link_status:{}\r\n",
                master.host,
                master.port,
                if master.link_up { "up" } else { "down" }
            ));
        }
        if let Some(vm) = &self.vm {
            text.push_str(&format!(
                "vm_enabled:1\r\nvm_swapped_keys:{}\r\nvm_used_pages:{}\r\nvm_total_pages:{}\r\nvm_swap_outs:{}\r\nvm_swap_ins:{}\r\n",
                vm.swapped_keys,
                vm.used_pages(),
                vm.page_count(),
                vm.swap_outs,
                vm.swap_ins,
            ));
        }
        for (idx, db) in self.keyspace.dbs().iter().enumerate() {
            if !db.is_empty() {
                text.push_str(&format!(
                    "db{idx}:keys={},expires={}\r\n",
                    db.len(),
                    db.expires.len()
                ));
            }
        }
        text
    }
}

/// Drives the executor until every `EngineHandle` is gone.
pub async fn run(
    mut engine: Engine,
    mut messages: mpsc::Receiver<EngineMessage>,
    mut events: mpsc::UnboundedReceiver<EngineEvent>,
) {
    let mut tick = tokio::time::interval(Duration::from_millis(100));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            Some(event) = events.recv() => engine.handle_event(event),
            maybe = messages.recv() => match maybe {
                Some(msg) => engine.handle_message(msg),
                None => break,
            },
            _ = tick.tick() => engine.cron(),
        }

        // drain bursts before sleeping again
        while let Ok(event) = events.try_recv() {
            engine.handle_event(event);
        }
        while let Ok(msg) = messages.try_recv() {
            engine.handle_message(msg);
        }
    }
    info!("executor stopped: all connections closed");
}

fn encode_select(dst: &mut BytesMut, db: usize) {
    encode_command(
        dst,
        &[Bytes::from_static(b"SELECT"), Bytes::from(db.to_string())],
    );
}

fn snap_value(value: &Value) -> SnapValue {
    match value {
        Value::Str(s) => SnapValue::Str(s.as_bytes()),
        Value::List(list) => SnapValue::List(list.iter().cloned().collect()),
        Value::Set(members) => SnapValue::Set(members.iter().cloned().collect()),
        Value::Zset(zset) => {
            SnapValue::Zset(zset.iter().map(|(m, s)| (m.clone(), s)).collect())
        }
        Value::Hash(hash) => SnapValue::Hash(hash.iter().collect()),
    }
}

fn write_snapshot(
    path: &std::path::Path,
    compression: bool,
    entries: &[SnapEntry],
) -> Result<(), SnapshotError> {
    let mut writer = SnapshotWriter::create(path, compression)?;
    for entry in entries {
        writer.write_entry(entry.db, &entry.key, &entry.value, entry.expire_at_secs)?;
    }
    writer.finish()
}
