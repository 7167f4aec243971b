//! Request/response correlation for one worker
//!
//! A single router task owns the pending table. Callers talk to it over a
//! command channel, so the table has one writer and needs no lock.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{FaceError, Result};

use super::protocol::{Op, WorkerRequest, WorkerResponse, UNADDRESSED_ID};

type Reply = oneshot::Sender<Result<Value>>;

enum Command {
    Dispatch { op: Op, params: Value, reply: Reply },
    Shutdown { done: oneshot::Sender<()> },
}

/// Caller-side handle on a router task
pub struct RouterHandle {
    name: String,
    commands: mpsc::UnboundedSender<Command>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl RouterHandle {
    /// Start routing between the caller and a worker that has completed its
    /// handshake
    pub fn spawn(
        name: &str,
        to_worker: mpsc::UnboundedSender<Value>,
        from_worker: mpsc::UnboundedReceiver<Value>,
    ) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let router = Router {
            name: name.to_string(),
            next_id: 0,
            pending: HashMap::new(),
            to_worker: Some(to_worker),
        };
        let task = tokio::spawn(router.run(command_rx, from_worker));

        Self {
            name: name.to_string(),
            commands,
            task: parking_lot::Mutex::new(Some(task)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Send `{id, op, ...params}` and wait for the matching response
    pub async fn request(&self, op: Op, params: Value) -> Result<Value> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Dispatch { op, params, reply })
            .map_err(|_| FaceError::Disposed)?;
        rx.await.unwrap_or(Err(FaceError::Disposed))
    }

    /// Fail everything pending with `Disposed`, tell the worker to release
    /// its resources and close the request channel
    pub async fn shutdown(&self) {
        let (done, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown { done }).is_ok() {
            let _ = rx.await;
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

struct Router {
    name: String,
    next_id: i64,
    pending: HashMap<i64, Reply>,
    to_worker: Option<mpsc::UnboundedSender<Value>>,
}

impl Router {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut from_worker: mpsc::UnboundedReceiver<Value>,
    ) {
        let mut worker_open = true;
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Dispatch { op, params, reply }) => self.dispatch(op, params, reply),
                    Some(Command::Shutdown { done }) => {
                        self.teardown();
                        let _ = done.send(());
                        break;
                    }
                    None => {
                        self.teardown();
                        break;
                    }
                },
                message = from_worker.recv(), if worker_open => match message {
                    Some(message) => self.route(message),
                    None => {
                        worker_open = false;
                        warn!("Worker {} closed its channel with {} pending", self.name, self.pending.len());
                        self.fail_all(|| FaceError::Worker("worker exited".into()));
                    }
                },
            }
        }
        debug!("Router for {} stopped", self.name);
    }

    fn take_id(&mut self) -> i64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn dispatch(&mut self, op: Op, params: Value, reply: Reply) {
        let id = self.take_id();
        let request = match WorkerRequest::new(id, op, params) {
            Ok(request) => request,
            Err(err) => {
                let _ = reply.send(Err(err));
                return;
            }
        };

        let sent = match &self.to_worker {
            Some(to_worker) => to_worker.send(request.to_value()).is_ok(),
            None => false,
        };
        if !sent {
            let _ = reply.send(Err(FaceError::Worker(format!("{} worker is not running", self.name))));
            return;
        }

        debug!("Dispatched {} #{} to {}", op.as_str(), id, self.name);
        self.pending.insert(id, reply);
    }

    fn route(&mut self, message: Value) {
        let Some(response) = WorkerResponse::parse(&message) else {
            warn!("Ignoring malformed message from {}: {}", self.name, message);
            return;
        };
        if response.id == UNADDRESSED_ID {
            return;
        }
        match self.pending.remove(&response.id) {
            Some(reply) => {
                let _ = reply.send(response.into_result());
            }
            None => warn!("Ignoring response #{} from {} with no pending request", response.id, self.name),
        }
    }

    fn fail_all(&mut self, error: impl Fn() -> FaceError) {
        for (_, reply) in self.pending.drain() {
            let _ = reply.send(Err(error()));
        }
    }

    fn teardown(&mut self) {
        let pending = self.pending.len();
        self.fail_all(|| FaceError::Disposed);

        if let Some(to_worker) = self.to_worker.take() {
            let id = self.take_id();
            if let Ok(dispose) = WorkerRequest::new(id, Op::Dispose, Value::Null) {
                let _ = to_worker.send(dispose.to_value());
            }
        }
        info!("Router for {} torn down ({} pending requests failed)", self.name, pending);
    }
}
