//! Running a module instance on its own thread.
//!
//! The owner talks to the worker only through messages ([`protocol`]). Calls
//! are correlated by id. Sandbox code on the worker cannot be suspended in
//! the middle of a call, so the few syscalls that need something only the
//! owner can do (read the terminal, sleep on its behalf) block the worker
//! on a shared control word instead: the worker posts a notice, the owner
//! does the work while it waits for its reply and then releases the worker.
//!
//! ```rust,ignore
//! let mut worker = WorkerChannel::spawn(std::io::stdin())?;
//! worker.init("python.wasm", WorkerOptions::default())?;
//! let output = worker.call_with_string("eval", "2 + 3", &[])?;
//! ```

mod control;
mod protocol;

pub use control::{ControlWord, SharedBlock, PENDING};
pub use protocol::{
    InitStatus, Notice, Reply, Request, StringPayload, Upstream, WorkerOptions, DEFAULT_BUFFER_SIZE,
};

use std::io::Read;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Result, WasmPosixError};
use crate::posix::{Capabilities, ImportMap};
use crate::wasm::{ModuleInstance, WasmRuntime};

/// Worker-side handle for blocking on the owner.
#[derive(Clone)]
pub struct BlockingClient {
    upstream: Sender<Upstream>,
    shared: Arc<SharedBlock>,
    pending: Arc<Mutex<Vec<u8>>>,
}

impl BlockingClient {
    fn new(upstream: Sender<Upstream>, shared: Arc<SharedBlock>) -> Self {
        Self {
            upstream,
            shared,
            pending: Arc::default(),
        }
    }

    fn request(&self, notice: Notice) -> Result<i32> {
        self.shared.control().arm();
        self.upstream
            .send(Upstream::Notice(notice))
            .map_err(|_| WasmPosixError::WorkerDisconnected)?;
        Ok(self.shared.control().wait())
    }

    /// Have the owner sleep, blocking this thread until it is done.
    pub fn sleep(&self, duration: Duration) -> Result<()> {
        let time = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        self.request(Notice::Sleep { time })?;
        Ok(())
    }

    /// Up to `max` bytes of the owner's stdin. Bytes the owner read beyond
    /// `max` are kept for the next call; an empty result is end of input.
    pub fn read_stdin(&self, max: usize) -> Result<Vec<u8>> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if pending.is_empty() && max > 0 {
            let n = self.request(Notice::WaitForStdin)?;
            pending.extend(self.shared.take(n.max(0) as usize));
        }
        let n = max.min(pending.len());
        Ok(pending.drain(..n).collect())
    }
}

impl std::fmt::Debug for BlockingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingClient")
            .field("capacity", &self.shared.capacity())
            .finish_non_exhaustive()
    }
}

/// Owner side of a worker thread hosting one module instance.
pub struct WorkerChannel {
    requests: Option<Sender<Request>>,
    upstream: Receiver<Upstream>,
    shared: Arc<SharedBlock>,
    stdin: Box<dyn Read + Send>,
    next_id: u64,
    thread: Option<JoinHandle<()>>,
}

impl WorkerChannel {
    /// Start a worker. `stdin` serves the worker's terminal reads.
    pub fn spawn(stdin: impl Read + Send + 'static) -> Result<Self> {
        let (request_tx, request_rx) = unbounded();
        let (upstream_tx, upstream_rx) = unbounded();
        let shared = Arc::new(SharedBlock::new(DEFAULT_BUFFER_SIZE));

        let thread = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("wasm-posix-worker".to_string())
                .spawn(move || worker_main(request_rx, upstream_tx, shared))?
        };

        Ok(Self {
            requests: Some(request_tx),
            upstream: upstream_rx,
            shared,
            stdin: Box::new(stdin),
            next_id: 0,
            thread: Some(thread),
        })
    }

    /// Load `name` on the worker. Fails with `WorkerInitError` carrying the
    /// worker's message when the module can't be loaded.
    pub fn init(&mut self, name: &str, options: WorkerOptions) -> Result<()> {
        self.shared.resize(options.stdin_buffer_size);
        self.send(Request::Init {
            name: name.to_string(),
            options,
        })?;

        loop {
            match self.recv()? {
                Upstream::Notice(Notice::Init {
                    status: InitStatus::Ok,
                    ..
                }) => {
                    debug!("worker loaded {}", name);
                    return Ok(());
                }
                Upstream::Notice(Notice::Init { error, .. }) => {
                    return Err(WasmPosixError::WorkerInitError(
                        error.unwrap_or_else(|| "unknown error".to_string()),
                    ));
                }
                Upstream::Notice(notice) => self.serve(notice)?,
                Upstream::Reply(reply) => {
                    return Err(WasmPosixError::Protocol(format!(
                        "reply {} received during init",
                        reply.id
                    )));
                }
            }
        }
    }

    /// Numeric call on the worker's instance.
    pub fn call(&mut self, name: &str, args: &[i64]) -> Result<Value> {
        let id = self.next_id();
        self.send(Request::Call {
            name: name.to_string(),
            args: args.to_vec(),
            id,
        })?;
        self.reply(id)
    }

    /// String (or argv) call on the worker's instance.
    pub fn call_with_string(
        &mut self,
        name: &str,
        text: impl Into<StringPayload>,
        args: &[i64],
    ) -> Result<Value> {
        let id = self.next_id();
        self.send(Request::CallWithString {
            name: name.to_string(),
            text: text.into(),
            args: args.to_vec(),
            id,
        })?;
        self.reply(id)
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn send(&self, request: Request) -> Result<()> {
        let requests = self
            .requests
            .as_ref()
            .ok_or(WasmPosixError::WorkerDisconnected)?;
        requests
            .send(request)
            .map_err(|_| WasmPosixError::WorkerDisconnected)
    }

    fn recv(&self) -> Result<Upstream> {
        self.upstream
            .recv()
            .map_err(|_| WasmPosixError::WorkerDisconnected)
    }

    /// Wait for the reply to `id`, serving blocking notices meanwhile.
    fn reply(&mut self, id: u64) -> Result<Value> {
        loop {
            match self.recv()? {
                Upstream::Reply(reply) if reply.id == id => return reply.into_result(),
                Upstream::Reply(reply) => {
                    warn!("dropping reply {} while waiting for {}", reply.id, id);
                }
                Upstream::Notice(Notice::Init { .. }) => {
                    return Err(WasmPosixError::Protocol(format!(
                        "init notice received while waiting for reply {}",
                        id
                    )));
                }
                Upstream::Notice(notice) => self.serve(notice)?,
            }
        }
    }

    /// Do a blocking operation for the worker and release it.
    fn serve(&mut self, notice: Notice) -> Result<()> {
        match notice {
            Notice::Sleep { time } => {
                debug!("worker sleep {}ms", time);
                thread::sleep(Duration::from_millis(time));
                self.shared.publish(&[]);
            }
            Notice::WaitForStdin => {
                let mut buf = vec![0; self.shared.capacity()];
                let n = match self.stdin.read(&mut buf) {
                    Ok(n) => n,
                    Err(e) => {
                        // the worker must not stay blocked; it sees end of input
                        self.shared.publish(&[]);
                        return Err(e.into());
                    }
                };
                debug!("worker stdin {} bytes", n);
                self.shared.publish(&buf[..n]);
            }
            Notice::Init { .. } => {
                return Err(WasmPosixError::Protocol("unexpected init notice".to_string()));
            }
        }
        Ok(())
    }
}

impl Drop for WorkerChannel {
    fn drop(&mut self) {
        // Closing the queue ends the worker loop.
        self.requests.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("worker thread panicked");
            }
        }
    }
}

fn worker_main(requests: Receiver<Request>, upstream: Sender<Upstream>, shared: Arc<SharedBlock>) {
    let mut instance: Option<ModuleInstance> = None;

    for request in requests.iter() {
        let message = match request {
            Request::Init { name, options } => {
                let client = BlockingClient::new(upstream.clone(), Arc::clone(&shared));
                let notice = match load(&name, options, client) {
                    Ok(loaded) => {
                        instance = Some(loaded);
                        Notice::Init {
                            status: InitStatus::Ok,
                            error: None,
                        }
                    }
                    Err(e) => {
                        warn!("worker failed to load {}: {}", name, e);
                        Notice::Init {
                            status: InitStatus::Error,
                            error: Some(e.to_string()),
                        }
                    }
                };
                Upstream::Notice(notice)
            }
            Request::Call { name, args, id } => {
                let result = loaded(&mut instance).and_then(|i| i.call(&name, &args));
                Upstream::Reply(Reply::from_result(id, result))
            }
            Request::CallWithString {
                name,
                text,
                args,
                id,
            } => {
                let result =
                    loaded(&mut instance).and_then(|i| i.call_with_string(&name, text.as_arg(), &args));
                Upstream::Reply(Reply::from_result(id, result))
            }
        };
        if upstream.send(message).is_err() {
            break;
        }
    }
    debug!("worker exiting");
}

fn load(name: &str, options: WorkerOptions, client: BlockingClient) -> Result<ModuleInstance> {
    let runtime = WasmRuntime::new(options.config)?;
    let module = runtime.load_module(name)?;
    runtime.instantiate_with(
        &module,
        ImportMap::new(),
        Capabilities::default().with_blocking(client),
    )
}

fn loaded(instance: &mut Option<ModuleInstance>) -> Result<&mut ModuleInstance> {
    instance
        .as_mut()
        .ok_or_else(|| WasmPosixError::Protocol("worker has no module loaded".to_string()))
}
