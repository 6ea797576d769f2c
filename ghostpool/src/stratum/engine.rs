//! The Stratum engine actor.
//!
//! One task owns every session, the job cache and the share engine. The
//! connection tasks, the API and the reward allocator talk to it through an
//! [`EngineHandle`], so share acceptance, vardiff and broadcasts are never
//! concurrent and need no locks.
//!
//! Each session holds the sending half of its connection's outbound queue.
//! Dropping the session drops the sender, which lets the writer task flush
//! what is queued and close the socket. That is how protocol violations and
//! overflowing queues close a connection.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::RngCore;
use serde::Serialize;
use serde_json::{json, Value};
use strum::IntoEnumIterator;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::messages::{
    parse_nonce, split_identity, ErrorCode, Method, Notification, ProtocolError, Request,
    Response, PROTOCOL_VERSION,
};
use super::ConnectionId;
use crate::address::Address;
use crate::error::{Error, Result};
use crate::node::{NodeClient, SubmitReport};
use crate::shares::report::render_table;
use crate::shares::{
    BlockCandidate, Contribution, PoolStats, ShareConfig, ShareEngine, ShareRejection, Submission,
};
use crate::template::{BlockTemplate, Encoding, Hash, IdentityMatcher, Job, JobId, TemplateStore};
use crate::tracing::prelude::*;
use crate::types::Difficulty;

/// Engine tuning.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub shares: ShareConfig,
    /// Number of live templates kept for share validation.
    pub cache_size: usize,
    /// Random extranonce bytes given to each connection, zero to disable.
    pub extranonce_size: usize,
    pub identities: IdentityMatcher,
    pub vardiff_interval: Duration,
    pub hashrate_interval: Duration,
    pub report_interval: Duration,
}

/// Commands accepted by the engine.
#[derive(Debug)]
pub enum EngineCommand {
    /// Register a new connection and its outbound queue.
    Connect {
        peer: SocketAddr,
        link: mpsc::Sender<String>,
        response_tx: oneshot::Sender<ConnectionId>,
    },
    Request {
        connection: ConnectionId,
        request: Request,
    },
    Disconnect {
        connection: ConnectionId,
    },
    /// Node verdict on a block found by a worker.
    BlockSubmitted {
        address: String,
        worker: String,
        hash: Hash,
        outcome: std::result::Result<SubmitReport, String>,
    },
    DrainContributions {
        response_tx: oneshot::Sender<Vec<Contribution>>,
    },
    Snapshot {
        response_tx: oneshot::Sender<PoolStats>,
    },
    #[cfg(test)]
    Contribute { contribution: Contribution },
}

/// Cloneable handle for sending commands to the engine.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    cmd_tx: mpsc::Sender<EngineCommand>,
}

impl EngineHandle {
    /// Register a connection. Lines for the miner are sent on `link`.
    pub async fn connect(&self, peer: SocketAddr, link: mpsc::Sender<String>) -> Result<ConnectionId> {
        self.call(|response_tx| EngineCommand::Connect {
            peer,
            link,
            response_tx,
        })
        .await
    }

    /// Queue a request. Requests from one connection are handled in the
    /// order they are queued.
    pub async fn request(&self, connection: ConnectionId, request: Request) -> Result<()> {
        self.send(EngineCommand::Request {
            connection,
            request,
        })
        .await
    }

    pub async fn disconnect(&self, connection: ConnectionId) {
        // Nothing to clean up if the engine is gone
        let _ = self.send(EngineCommand::Disconnect { connection }).await;
    }

    /// Take every contribution accepted since the previous drain.
    pub async fn drain_contributions(&self) -> Result<Vec<Contribution>> {
        self.call(|response_tx| EngineCommand::DrainContributions { response_tx })
            .await
    }

    pub async fn snapshot(&self) -> Result<PoolStats> {
        self.call(|response_tx| EngineCommand::Snapshot { response_tx })
            .await
    }

    /// Queue work for the allocator as if a share had been accepted.
    #[cfg(test)]
    pub(crate) async fn contribute(&self, contribution: Contribution) -> Result<()> {
        self.send(EngineCommand::Contribute { contribution }).await
    }

    async fn send(&self, cmd: EngineCommand) -> Result<()> {
        self.cmd_tx.send(cmd).await.map_err(|_| Error::EngineStopped)
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> EngineCommand) -> Result<T> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(make(response_tx)).await?;
        response_rx.await.map_err(|_| Error::EngineStopped)
    }
}

struct Session {
    peer: SocketAddr,
    link: mpsc::Sender<String>,
    difficulty: Difficulty,
    extranonce: String,
    encoding: Encoding,
    subscribed: bool,
    /// Authorized workers, name to address.
    workers: HashMap<String, String>,
}

pub struct StratumEngine {
    config: EngineConfig,
    sessions: slotmap::SlotMap<ConnectionId, Session>,
    subscribers: HashSet<ConnectionId>,
    templates: TemplateStore,
    shares: ShareEngine,
    node: Arc<dyn NodeClient>,
    cmd_rx: mpsc::Receiver<EngineCommand>,
    /// For block submission tasks to report back without keeping the
    /// engine alive.
    cmd_tx: mpsc::WeakSender<EngineCommand>,
    template_rx: mpsc::Receiver<BlockTemplate>,
    shutdown: CancellationToken,
}

impl StratumEngine {
    /// Create the engine and the handle used to reach it.
    pub fn new(
        config: EngineConfig,
        node: Arc<dyn NodeClient>,
        template_rx: mpsc::Receiver<BlockTemplate>,
        shutdown: CancellationToken,
    ) -> (Self, EngineHandle) {
        let (cmd_tx, cmd_rx) = mpsc::channel(1024);
        let shares = ShareEngine::new(config.shares.clone(), Instant::now());
        let engine = Self {
            templates: TemplateStore::new(config.cache_size),
            shares,
            config,
            sessions: slotmap::SlotMap::with_key(),
            subscribers: HashSet::new(),
            node,
            cmd_rx,
            cmd_tx: cmd_tx.downgrade(),
            template_rx,
            shutdown,
        };
        (engine, EngineHandle { cmd_tx })
    }

    /// Run until shutdown, then handle whatever commands are still queued.
    pub async fn run(mut self) {
        let mut vardiff = ticker(self.config.vardiff_interval);
        let mut hashrate = ticker(self.config.hashrate_interval);
        let mut report = ticker(self.config.report_interval);
        info!(
            initial_difficulty = %self.config.shares.initial_difficulty,
            cache_size = self.config.cache_size,
            "Stratum engine started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                Some(cmd) = self.cmd_rx.recv() => self.handle_command(cmd, Instant::now()),
                Some(template) = self.template_rx.recv() => self.admit_template(template),
                _ = vardiff.tick() => self.vardiff_tick(Instant::now()),
                _ = hashrate.tick() => self.hashrate_tick(Instant::now()),
                _ = report.tick() => {
                    info!("{}", render_table(&self.snapshot(Instant::now())));
                }
            }
        }

        self.cmd_rx.close();
        let mut drained = 0;
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            self.handle_command(cmd, Instant::now());
            drained += 1;
        }
        info!(
            drained,
            connections = self.sessions.len(),
            pending_contributions = self.shares.pending_contributions(),
            "Stratum engine stopped"
        );
    }

    fn handle_command(&mut self, cmd: EngineCommand, now: Instant) {
        match cmd {
            EngineCommand::Connect {
                peer,
                link,
                response_tx,
            } => {
                let connection = self.sessions.insert(Session {
                    peer,
                    link,
                    difficulty: self.config.shares.initial_difficulty,
                    extranonce: new_extranonce(self.config.extranonce_size),
                    encoding: Encoding::default(),
                    subscribed: false,
                    workers: HashMap::new(),
                });
                debug!(peer = %peer, connections = self.sessions.len(), "Miner connected");
                if response_tx.send(connection).is_err() {
                    self.close(connection);
                }
            }
            EngineCommand::Request {
                connection,
                request,
            } => self.handle_request(connection, request, now),
            EngineCommand::Disconnect { connection } => {
                if let Some(session) = self.sessions.get(connection) {
                    debug!(peer = %session.peer, "Miner disconnected");
                    self.close(connection);
                }
            }
            EngineCommand::BlockSubmitted {
                address,
                worker,
                hash,
                outcome,
            } => match outcome {
                Ok(SubmitReport::Success) => {
                    info!(address = %address, worker = %worker, hash = %hash, "Block accepted by node");
                    self.shares.record_block(&address, &worker);
                }
                Ok(SubmitReport::Rejected(reason)) => {
                    warn!(address = %address, worker = %worker, hash = %hash, reason = %reason, "Block rejected by node");
                }
                Err(e) => {
                    error!(address = %address, worker = %worker, hash = %hash, error = %e, "Block submission failed");
                }
            },
            EngineCommand::DrainContributions { response_tx } => {
                let _ = response_tx.send(self.shares.drain_contributions());
            }
            EngineCommand::Snapshot { response_tx } => {
                let _ = response_tx.send(self.snapshot(now));
            }
            #[cfg(test)]
            EngineCommand::Contribute { contribution } => {
                self.shares.contribute(contribution, now);
            }
        }
    }

    fn handle_request(&mut self, connection: ConnectionId, request: Request, now: Instant) {
        let Some(session) = self.sessions.get(connection) else {
            trace!(method = %request.method, "Request for closed connection");
            return;
        };
        let peer = session.peer;
        trace!(peer = %peer, method = %request.method, "Request");

        let result = match request.method.parse::<Method>() {
            Ok(Method::Subscribe) => self.subscribe(connection, &request),
            Ok(Method::ExtranonceSubscribe) => {
                self.send(connection, &Response::ok(request.id.clone(), json!(true)));
                Ok(())
            }
            Ok(Method::Authorize) => self.authorize(connection, &request, now),
            Ok(Method::Submit) => self.submit(connection, &request, now),
            Err(_) => Err(ProtocolError::UnknownMethod(request.method.clone())),
        };

        match result {
            Ok(()) => {}
            Err(e) if e.is_violation() => {
                warn!(peer = %peer, method = %request.method, error = %e, "Protocol violation, closing connection");
                self.close(connection);
            }
            Err(e) => {
                debug!(peer = %peer, error = %e, "Rejected request");
                self.send(connection, &Response::error(request.id, ErrorCode::UnknownMethod));
            }
        }
    }

    fn subscribe(&mut self, connection: ConnectionId, request: &Request) -> std::result::Result<(), ProtocolError> {
        let Some(session) = self.sessions.get_mut(connection) else {
            return Ok(());
        };
        if session.subscribed {
            return Err(ProtocolError::AlreadySubscribed);
        }

        let identity = request.params.first().and_then(Value::as_str).unwrap_or_default();
        session.encoding = self.config.identities.encoding_for(identity);
        session.subscribed = true;
        info!(peer = %session.peer, identity, encoding = %session.encoding, "Miner subscribed");
        self.subscribers.insert(connection);

        self.send(
            connection,
            &Response::ok(request.id.clone(), json!([true, PROTOCOL_VERSION])),
        );
        if let Some(job) = self.templates.latest().cloned() {
            self.send_job(connection, &job);
        }
        Ok(())
    }

    fn authorize(
        &mut self,
        connection: ConnectionId,
        request: &Request,
        now: Instant,
    ) -> std::result::Result<(), ProtocolError> {
        let (address, worker) = split_identity(request.str_param(0, "worker identity")?);
        let address: Address = address.parse()?;

        let Some(session) = self.sessions.get_mut(connection) else {
            return Ok(());
        };
        if session.workers.contains_key(worker) {
            return Err(ProtocolError::DuplicateWorker(worker.to_string()));
        }
        session
            .workers
            .insert(worker.to_string(), address.to_string());
        let encoding = session.encoding;
        let extranonce = session.extranonce.clone();

        let difficulty =
            self.shares
                .register_worker(address.as_str(), worker, connection, encoding, now);
        if let Some(session) = self.sessions.get_mut(connection) {
            session.difficulty = difficulty;
        }
        info!(address = %address, worker, difficulty = %difficulty, "Worker authorized");

        self.send(connection, &Notification::set_extranonce(&extranonce));
        self.send(connection, &Notification::set_difficulty(difficulty));
        self.send(connection, &Response::ok(request.id.clone(), json!(true)));
        Ok(())
    }

    fn submit(
        &mut self,
        connection: ConnectionId,
        request: &Request,
        now: Instant,
    ) -> std::result::Result<(), ProtocolError> {
        let (address, worker) = split_identity(request.str_param(0, "worker identity")?);
        let Some(session) = self.sessions.get(connection) else {
            return Ok(());
        };
        if session.workers.get(worker).map(String::as_str) != Some(address) {
            return Err(ProtocolError::WorkerMismatch {
                address: address.to_string(),
                worker: worker.to_string(),
            });
        }
        let job_id = request.str_param(1, "job id")?;
        let nonce = parse_nonce(request.str_param(2, "nonce")?, &session.extranonce)?;
        let session_difficulty = session.difficulty;

        let Some(header_hash) = job_id
            .parse::<JobId>()
            .ok()
            .and_then(|id| self.templates.resolve(id))
        else {
            debug!(address, worker, job_id, "Job not found");
            self.shares.record_job_not_found(address, worker);
            self.send(connection, &Response::reject(request.id.clone(), ErrorCode::JobNotFound));
            return Ok(());
        };

        let difficulty = self
            .shares
            .worker_difficulty(address, worker)
            .unwrap_or(session_difficulty);
        let share = Submission {
            address,
            worker,
            header_hash,
            difficulty,
            nonce,
        };

        let id = request.id.clone();
        let response = match self.shares.add_share(share, &mut self.templates, now) {
            Ok(accepted) => {
                if let Some(block) = accepted.block {
                    self.submit_block(block);
                }
                Response::ok(id, json!(true))
            }
            Err(ShareRejection::Duplicate) => Response::reject(id, ErrorCode::DuplicateShare),
            Err(ShareRejection::Stale) => Response::reject(id, ErrorCode::JobNotFound),
            Err(ShareRejection::Invalid) => Response::reject(id, ErrorCode::LowDifficultyShare),
        };
        self.send(connection, &response);
        Ok(())
    }

    // Submission runs off the engine task; the verdict comes back as a
    // command.
    fn submit_block(&self, block: BlockCandidate) {
        let node = Arc::clone(&self.node);
        let reply = self.cmd_tx.clone();
        let hash = block.template.header.hash();
        info!(address = %block.address, worker = %block.worker, hash = %hash, "Submitting block");

        tokio::spawn(async move {
            let outcome = node
                .submit_block(&block.template)
                .await
                .map_err(|e| e.to_string());
            if let Some(cmd_tx) = reply.upgrade() {
                let _ = cmd_tx
                    .send(EngineCommand::BlockSubmitted {
                        address: block.address,
                        worker: block.worker,
                        hash,
                        outcome,
                    })
                    .await;
            }
        });
    }

    fn admit_template(&mut self, template: BlockTemplate) {
        if let Some(job) = self.templates.admit(template) {
            self.broadcast(&job);
        }
    }

    /// Send a job to every subscribed connection, encoding it once per
    /// encoding. Connections found closed are dropped.
    fn broadcast(&mut self, job: &Job) {
        let lines: HashMap<Encoding, String> = Encoding::iter()
            .filter_map(|encoding| {
                let notify = Notification::notify(job.notify_params(encoding));
                serde_json::to_string(&notify).ok().map(|line| (encoding, line))
            })
            .collect();

        let mut delivered = 0;
        let subscribers: Vec<ConnectionId> = self.subscribers.iter().copied().collect();
        for connection in subscribers {
            let Some(session) = self.sessions.get(connection) else {
                self.subscribers.remove(&connection);
                continue;
            };
            if session.link.is_closed() {
                trace!(peer = %session.peer, "Skipping closed connection");
                self.close(connection);
                continue;
            }
            let Some(line) = lines.get(&session.encoding) else {
                continue;
            };
            if self.send_line(connection, line.clone()) {
                delivered += 1;
            }
        }
        debug!(job_id = %job.id, delivered, "Broadcast job");
    }

    fn send_job(&mut self, connection: ConnectionId, job: &Job) {
        let Some(session) = self.sessions.get(connection) else {
            return;
        };
        let notify = Notification::notify(job.notify_params(session.encoding));
        self.send(connection, &notify);
    }

    fn vardiff_tick(&mut self, now: Instant) {
        for change in self.shares.vardiff_tick(now) {
            let notification = Notification::set_difficulty(change.difficulty);
            for connection in change.connections {
                if let Some(session) = self.sessions.get_mut(connection) {
                    session.difficulty = change.difficulty;
                    self.send(connection, &notification);
                }
            }
        }
    }

    fn hashrate_tick(&mut self, now: Instant) {
        let total = self.shares.update_hashrates(now);
        info!(
            hashrate = %total,
            connections = self.sessions.len(),
            templates = self.templates.len(),
            "Pool hashrate"
        );
    }

    fn snapshot(&self, now: Instant) -> PoolStats {
        let mut stats = self.shares.snapshot(now);
        stats.connections = self.sessions.len();
        stats.live_templates = self.templates.len();
        stats
    }

    fn send<T: Serialize>(&mut self, connection: ConnectionId, message: &T) -> bool {
        match serde_json::to_string(message) {
            Ok(line) => self.send_line(connection, line),
            Err(e) => {
                error!(error = %e, "Failed to encode message");
                false
            }
        }
    }

    // Queue a line without waiting. A miner that does not keep up with its
    // queue is disconnected.
    fn send_line(&mut self, connection: ConnectionId, line: String) -> bool {
        let Some(session) = self.sessions.get(connection) else {
            return false;
        };
        match session.link.try_send(line) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(peer = %session.peer, "Outbound queue full, closing connection");
                self.close(connection);
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.close(connection);
                false
            }
        }
    }

    fn close(&mut self, connection: ConnectionId) {
        self.subscribers.remove(&connection);
        if let Some(session) = self.sessions.remove(connection) {
            for address in session.workers.values() {
                self.shares.release_connection(address, connection);
            }
        }
    }
}

fn ticker(period: Duration) -> Interval {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

fn new_extranonce(size: usize) -> String {
    let mut bytes = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
