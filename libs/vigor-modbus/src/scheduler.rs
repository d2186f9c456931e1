//! Bus scheduler
//!
//! One worker task owns the link and drains a shared queue, so exactly one
//! request is on the wire at any time. Producers (the poll loop, write
//! callers) only enqueue and await a oneshot reply.
//!
//! Queue policy:
//! - writes are served before reads; each queue is FIFO
//! - a write to an address that already has a queued (not yet sent) write
//!   replaces it, and the replaced caller gets `Superseded`
//!
//! Pacing: every frame waits `inter_frame_gap` after the previous frame
//! completed; writes also wait `write_interval` after the previous write.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, Notify};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::BusConfig;
use crate::connection::Link;
use crate::error::{Result, VigorError};
use crate::frame::FrameCodec;
use crate::pdu::{ModbusPdu, Request, Response};

type Reply = oneshot::Sender<Result<Response>>;

#[derive(Debug)]
struct Job {
    request: Request,
    reply: Reply,
}

#[derive(Debug, Default)]
struct QueueState {
    writes: VecDeque<Job>,
    reads: VecDeque<Job>,
    /// New link handed over by a reconnect, installed before the next job
    replacement: Option<Box<dyn Link>>,
    closed: bool,
}

/// Counters exposed through engine status
#[derive(Debug, Default)]
pub struct BusStats {
    pub frames_sent: AtomicU64,
    pub retries: AtomicU64,
    pub superseded: AtomicU64,
}

#[derive(Debug)]
struct Shared {
    queue: Mutex<QueueState>,
    notify: Notify,
    link_up: AtomicBool,
    stats: BusStats,
}

/// Producer side of the bus; cheap to clone
#[derive(Debug, Clone)]
pub struct BusHandle {
    shared: Arc<Shared>,
}

impl BusHandle {
    /// Queue a request without waiting for it
    pub fn enqueue(&self, request: Request) -> oneshot::Receiver<Result<Response>> {
        let (reply, rx) = oneshot::channel();
        {
            let mut queue = self.shared.queue.lock();
            if queue.closed {
                let _ = reply.send(Err(VigorError::EngineClosed));
                return rx;
            }

            let job = Job { request, reply };
            if request.is_write() {
                let address = request.address();
                if let Some(pos) = queue
                    .writes
                    .iter()
                    .position(|queued| queued.request.address() == address)
                {
                    if let Some(stale) = queue.writes.remove(pos) {
                        debug!("Write to {} superseded before send", address);
                        self.shared.stats.superseded.fetch_add(1, Ordering::Relaxed);
                        let _ = stale.reply.send(Err(VigorError::Superseded(address)));
                    }
                }
                queue.writes.push_back(job);
            } else {
                queue.reads.push_back(job);
            }
        }
        self.shared.notify.notify_one();
        rx
    }

    /// Queue a request and wait for its outcome
    pub async fn submit(&self, request: Request) -> Result<Response> {
        self.enqueue(request)
            .await
            .unwrap_or(Err(VigorError::EngineClosed))
    }

    /// Hand a freshly opened link to the worker
    pub fn replace_link(&self, link: Box<dyn Link>) -> Result<()> {
        {
            let mut queue = self.shared.queue.lock();
            if queue.closed {
                return Err(VigorError::EngineClosed);
            }
            queue.replacement = Some(link);
        }
        self.shared.link_up.store(true, Ordering::SeqCst);
        self.shared.notify.notify_one();
        Ok(())
    }

    pub fn is_link_up(&self) -> bool {
        self.shared.link_up.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.queue.lock().closed
    }

    pub fn stats(&self) -> &BusStats {
        &self.shared.stats
    }
}

/// Consumer side of the bus: owns the link
#[derive(Debug)]
pub struct BusWorker {
    shared: Arc<Shared>,
    link: Option<Box<dyn Link>>,
    codec: Box<dyn FrameCodec>,
    unit_id: u8,
    config: BusConfig,
    cancel: CancellationToken,
    last_frame_done: Option<Instant>,
    last_write_done: Option<Instant>,
}

/// Create a bus over `link`; run the returned worker on its own task
pub fn bus(
    link: Box<dyn Link>,
    codec: Box<dyn FrameCodec>,
    unit_id: u8,
    config: BusConfig,
    cancel: CancellationToken,
) -> (BusHandle, BusWorker) {
    let shared = Arc::new(Shared {
        queue: Mutex::new(QueueState::default()),
        notify: Notify::new(),
        link_up: AtomicBool::new(true),
        stats: BusStats::default(),
    });
    let handle = BusHandle {
        shared: Arc::clone(&shared),
    };
    let worker = BusWorker {
        shared,
        link: Some(link),
        codec,
        unit_id,
        config,
        cancel,
        last_frame_done: None,
        last_write_done: None,
    };
    (handle, worker)
}

impl BusWorker {
    pub async fn run(mut self) {
        debug!("Bus worker started ({} framing)", self.codec.mode());
        let cancel = self.cancel.clone();
        loop {
            let job = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                job = self.next_job() => job,
            };

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = self.execute(&job.request) => Some(result),
            };
            match outcome {
                Some(result) => {
                    let _ = job.reply.send(result);
                },
                None => {
                    let _ = job.reply.send(Err(VigorError::EngineClosed));
                    break;
                },
            }
        }
        self.shutdown();
    }

    async fn next_job(&mut self) -> Job {
        loop {
            if let Some(job) = self.take_job() {
                return job;
            }
            self.shared.notify.notified().await;
        }
    }

    fn take_job(&mut self) -> Option<Job> {
        let mut queue = self.shared.queue.lock();
        if let Some(link) = queue.replacement.take() {
            info!("Link replaced");
            self.link = Some(link);
            self.codec = self.codec.mode().codec();
            self.shared.link_up.store(true, Ordering::SeqCst);
        }
        queue.writes.pop_front().or_else(|| queue.reads.pop_front())
    }

    fn shutdown(&mut self) {
        let drained: Vec<Job> = {
            let mut queue = self.shared.queue.lock();
            let state = &mut *queue;
            state.closed = true;
            state.replacement = None;
            state.writes.drain(..).chain(state.reads.drain(..)).collect()
        };
        for job in drained {
            let _ = job.reply.send(Err(VigorError::EngineClosed));
        }
        self.link = None;
        self.shared.link_up.store(false, Ordering::SeqCst);
        debug!("Bus worker stopped");
    }

    async fn execute(&mut self, request: &Request) -> Result<Response> {
        if self.link.is_none() {
            return Err(VigorError::link("Link is down; reconnect required"));
        }
        let pdu = request.to_pdu()?;

        let mut attempt: u32 = 0;
        loop {
            match self.transact(request, &pdu).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    attempt += 1;
                    self.shared.stats.retries.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "Retry {}/{} FC{:02X}@{}: {}",
                        attempt,
                        self.config.max_retries,
                        request.function_code(),
                        request.address(),
                        e
                    );
                },
                Err(e) => {
                    if e.needs_reconnect() {
                        error!("Link lost: {}", e);
                        self.link = None;
                        self.shared.link_up.store(false, Ordering::SeqCst);
                    }
                    return Err(e);
                },
            }
        }
    }

    /// Earliest instant the next frame may go out
    fn ready_at(&self, is_write: bool) -> Option<Instant> {
        let mut ready = self
            .last_frame_done
            .map(|done| done + self.config.inter_frame_gap());
        if is_write {
            if let Some(done) = self.last_write_done {
                let write_ready = done + self.config.write_interval();
                ready = Some(ready.map_or(write_ready, |r| r.max(write_ready)));
            }
        }
        ready
    }

    /// One attempt: pace, send, await and decode the response
    async fn transact(&mut self, request: &Request, pdu: &ModbusPdu) -> Result<Response> {
        if let Some(at) = self.ready_at(request.is_write()) {
            if at > Instant::now() {
                sleep_until(at).await;
            }
        }

        let link = self
            .link
            .as_mut()
            .ok_or_else(|| VigorError::link("Link is down; reconnect required"))?;
        link.discard_pending().await;

        let frame = self.codec.encode_request(self.unit_id, pdu);
        self.shared.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
        debug!(
            "TX FC{:02X}@{} ({}B)",
            request.function_code(),
            request.address(),
            frame.len()
        );

        let exchange = match link.send(&frame).await {
            Ok(()) => link.receive(self.config.request_timeout()).await,
            Err(e) => Err(e),
        };

        let done = Instant::now();
        self.last_frame_done = Some(done);
        if request.is_write() {
            self.last_write_done = Some(done);
        }

        let response_pdu = self.codec.decode_response(&exchange?)?;
        request.parse_response(&response_pdu)
    }
}
