//! NFQUEUE workers: one netlink socket per address family.
//!
//! The socket is owned by a single blocking I/O thread. Packets fan out to
//! per-packet pipeline tasks; their verdicts funnel back to the owning
//! thread over a channel, which keeps netlink submission serialized. On a
//! fatal socket error the thread drops the socket and re-opens it with the
//! same configuration until shutdown.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use nfq::{Queue, Verdict};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};

use crate::packet::{Family, PacketRecord, ReplyHandle, VerdictRequest};
use crate::pipeline::Pipeline;

/// Idle poll interval of the nonblocking receive loop.
const POLL_INTERVAL: Duration = Duration::from_millis(2);
/// Backoff before the single admission retry when the pool is full.
const ADMIT_RETRY_DELAY: Duration = Duration::from_millis(10);
/// Backoff between socket reopen attempts.
const REOPEN_DELAY: Duration = Duration::from_millis(100);
/// How long in-flight pipelines get to land verdicts during shutdown.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub queue_num: u16,
    pub family: Family,
    /// Bytes of each packet copied to user space; headers plus a little
    /// transport context is enough, payloads are never inspected.
    pub max_packet_len: u16,
    /// Kernel-side queue length before fail-open kicks in.
    pub max_queue_len: u32,
    /// Concurrent pipeline bound (admission slots).
    pub capacity: usize,
}

pub struct QueueWorker {
    cfg: QueueConfig,
    pipeline: Arc<Pipeline>,
    queue: Option<Queue>,
    verdict_tx: mpsc::Sender<VerdictRequest>,
    verdict_rx: Option<mpsc::Receiver<VerdictRequest>>,
}

impl QueueWorker {
    /// Open and configure the netlink socket. Fails loudly; a worker that
    /// cannot bind its queue is a startup error.
    pub fn open(cfg: QueueConfig, pipeline: Arc<Pipeline>) -> Result<Self> {
        let queue = open_socket(&cfg)?;
        info!(queue = cfg.queue_num, family = %cfg.family, "nfqueue bound");
        let (verdict_tx, verdict_rx) = mpsc::channel();
        Ok(Self {
            cfg,
            pipeline,
            queue: Some(queue),
            verdict_tx,
            verdict_rx: Some(verdict_rx),
        })
    }

    /// Drive the worker until the shutdown signal fires, then drain and
    /// close the socket.
    pub async fn run(mut self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let queue = self
            .queue
            .take()
            .context("queue worker already running")?;
        let verdict_rx = self
            .verdict_rx
            .take()
            .context("queue worker already running")?;
        let io = IoLoop {
            cfg: self.cfg.clone(),
            pipeline: self.pipeline.clone(),
            verdict_tx: self.verdict_tx.clone(),
            verdict_rx,
            slots: Arc::new(Semaphore::new(self.cfg.capacity)),
            seq: AtomicU64::new(0),
            shutdown,
            rt: tokio::runtime::Handle::current(),
        };
        tokio::task::spawn_blocking(move || io.run(queue))
            .await
            .context("queue worker I/O thread panicked")?;
        info!(queue = self.cfg.queue_num, family = %self.cfg.family, "nfqueue worker stopped");
        Ok(())
    }
}

fn open_socket(cfg: &QueueConfig) -> Result<Queue> {
    let mut queue = Queue::open().context("opening nfnetlink_queue socket")?;
    queue
        .bind(cfg.queue_num)
        .with_context(|| format!("binding queue {}", cfg.queue_num))?;
    queue
        .set_fail_open(cfg.queue_num, true)
        .context("enabling fail-open")?;
    queue
        .set_copy_range(cfg.queue_num, cfg.max_packet_len)
        .context("setting copy range")?;
    queue
        .set_queue_max_len(cfg.queue_num, cfg.max_queue_len)
        .context("setting queue length")?;
    let _ = queue.set_nonblocking(true);
    Ok(queue)
}

struct IoLoop {
    cfg: QueueConfig,
    pipeline: Arc<Pipeline>,
    verdict_tx: mpsc::Sender<VerdictRequest>,
    verdict_rx: mpsc::Receiver<VerdictRequest>,
    slots: Arc<Semaphore>,
    seq: AtomicU64,
    shutdown: watch::Receiver<bool>,
    rt: tokio::runtime::Handle,
}

impl IoLoop {
    fn run(self, first: Queue) {
        let mut queue = Some(first);
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            let Some(q) = queue.as_mut() else {
                // Restarting: reopen with the same configuration.
                match open_socket(&self.cfg) {
                    Ok(fresh) => {
                        info!(queue = self.cfg.queue_num, "nfqueue socket reopened");
                        queue = Some(fresh);
                    }
                    Err(e) => {
                        debug!(queue = self.cfg.queue_num, error = %e, "nfqueue reopen failed");
                        thread::sleep(REOPEN_DELAY);
                    }
                }
                continue;
            };

            self.drain_verdicts(q);

            match q.recv() {
                Ok(msg) => self.dispatch(msg),
                Err(e) if is_transient(&e) => thread::sleep(POLL_INTERVAL),
                Err(e) => {
                    if *self.shutdown.borrow() {
                        // Socket torn down underneath us during shutdown.
                        break;
                    }
                    error!(
                        queue = self.cfg.queue_num,
                        error = %e,
                        "error while receiving packets, reopening socket"
                    );
                    queue = None;
                }
            }
        }

        // Give in-flight pipelines a bounded window to land their verdicts.
        if let Some(mut q) = queue {
            let deadline = Instant::now() + SHUTDOWN_DRAIN;
            while Instant::now() < deadline {
                self.drain_verdicts(&mut q);
                if self.slots.available_permits() == self.cfg.capacity {
                    break;
                }
                thread::sleep(POLL_INTERVAL);
            }
            self.drain_verdicts(&mut q);
        }
    }

    fn drain_verdicts(&self, q: &mut Queue) {
        while let Ok(req) = self.verdict_rx.try_recv() {
            submit_verdict(q, req);
        }
    }

    /// Admit a packet into the bounded pipeline pool and hand it to a fresh
    /// task. Saturation gets one retry after a short sleep; after that the
    /// packet goes back to the kernel, which releases it via queue-bypass.
    fn dispatch(&self, msg: nfq::Message) {
        let permit = match self.slots.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(
                    queue = self.cfg.queue_num,
                    "failed to queue packet, slowing down intake"
                );
                thread::sleep(ADMIT_RETRY_DELAY);
                match self.slots.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        warn!(queue = self.cfg.queue_num, "failed to queue packet again, dropping");
                        return;
                    }
                }
            }
        };

        // Copy the payload out of the netlink buffer before the record
        // leaves this thread.
        let data = msg.get_payload().to_vec();
        let id = self.seq.fetch_add(1, Ordering::Relaxed);
        let record = PacketRecord::new(
            id,
            self.cfg.family,
            data,
            ReplyHandle {
                msg,
                tx: self.verdict_tx.clone(),
            },
        );

        let pipeline = self.pipeline.clone();
        self.rt.spawn(async move {
            let _permit = permit;
            pipeline.process(record).await;
        });
    }
}

/// Submit one verdict over the socket. The message is consumed by the
/// attempt; a failed submission is logged and the packet left to the
/// kernel's queue-bypass timeout.
fn submit_verdict(q: &mut Queue, req: VerdictRequest) {
    let VerdictRequest {
        mut msg,
        mark,
        summary,
    } = req;
    msg.set_verdict(Verdict::Accept);
    msg.set_nfmark(mark);
    if let Err(e) = q.verdict(msg) {
        error!(
            flow = %summary,
            mark = mark,
            verdict = crate::marks::describe(mark),
            error = %e,
            "failed to set verdict"
        );
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::TimedOut
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_error_kinds() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::WouldBlock)));
        assert!(is_transient(&io::Error::from(io::ErrorKind::Interrupted)));
        assert!(is_transient(&io::Error::from(io::ErrorKind::TimedOut)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::BrokenPipe)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::NotConnected)));
    }

    #[test]
    fn test_admission_bound() {
        let slots = Arc::new(Semaphore::new(2));
        let first = slots.clone().try_acquire_owned().unwrap();
        let _second = slots.clone().try_acquire_owned().unwrap();
        assert!(slots.clone().try_acquire_owned().is_err());
        drop(first);
        assert!(slots.clone().try_acquire_owned().is_ok());
    }
}
