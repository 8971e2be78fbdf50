//! The per-proxy service thread: drain the trigger fifo, dispatch to the
//! connection table, publish the tail at the flush cadence.
//!
//! The loop is a busy spin that saturates one core. The run state is
//! read once per `run_state_check_period` polls so the common iteration
//! stays inside the fifo's cache lines.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::config::ProxyConfig;
use crate::device::{DeviceApi, StreamHandle};
use crate::error::{Result, TrigonError};
use crate::fifo::{DeviceFifo, TriggerFifo};
use crate::numa;
use crate::transport::{self, HostConnection};
use crate::trigger::{Trigger, TriggerType};
use crate::types::TransportType;

/// Lifecycle state of one proxy.
///
/// Controllers move Running → Exiting; only the service thread writes
/// Idle. The word is a plain release/acquire atomic; the states are
/// strictly ordered and the transitions unambiguous, so no lock is
/// involved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RunState {
    Idle = 0,
    Running = 1,
    Exiting = 2,
}

pub(crate) struct RunFlag(AtomicU32);

impl RunFlag {
    pub(crate) fn new(state: RunState) -> Self {
        Self(AtomicU32::new(state as u32))
    }

    pub(crate) fn load(&self) -> RunState {
        match self.0.load(Ordering::Acquire) {
            0 => RunState::Idle,
            1 => RunState::Running,
            _ => RunState::Exiting,
        }
    }

    pub(crate) fn store(&self, state: RunState) {
        self.0.store(state as u32, Ordering::Release);
    }
}

/// What kind of proxy to attach and the transport state it needs.
#[derive(Debug, Clone, Copy)]
pub enum ProxySpec {
    /// Intra-host proxy; owns no IB context. `stream` is the CUDA
    /// stream its P2P connections copy on, synchronized at shutdown.
    P2p { stream: StreamHandle },
    /// RDMA proxy; completion is the connections' business (`flush`
    /// drains their CQs), so shutdown has no stream to wait on.
    Ib,
}

impl ProxySpec {
    pub fn transport(&self) -> TransportType {
        match self {
            ProxySpec::P2p { .. } => TransportType::P2p,
            ProxySpec::Ib => TransportType::Ib,
        }
    }
}

/// One proxy: its fifo, its run state, and (while running) its thread.
pub struct Proxy {
    index: usize,
    transport: TransportType,
    p2p_stream: Option<StreamHandle>,
    run: Arc<RunFlag>,
    device_view: DeviceFifo,
    host_view: DeviceFifo,
    /// Present before start and again after a joined shutdown.
    fifo: Option<TriggerFifo>,
    thread: Option<JoinHandle<TriggerFifo>>,
}

impl Proxy {
    pub(crate) fn create(
        index: usize,
        spec: ProxySpec,
        device: &Arc<dyn DeviceApi>,
        config: &ProxyConfig,
    ) -> Result<Self> {
        let fifo = TriggerFifo::create(Arc::clone(device), config)?;
        Ok(Self {
            index,
            transport: spec.transport(),
            p2p_stream: match spec {
                ProxySpec::P2p { stream } => Some(stream),
                ProxySpec::Ib => None,
            },
            run: Arc::new(RunFlag::new(RunState::Idle)),
            device_view: fifo.device_view(),
            host_view: fifo.host_view(),
            fifo: Some(fifo),
            thread: None,
        })
    }

    pub fn transport(&self) -> TransportType {
        self.transport
    }

    /// Current lifecycle state.
    pub fn run_state(&self) -> RunState {
        self.run.load()
    }

    /// The kernel-facing fifo addresses for this proxy.
    pub fn device_fifo(&self) -> DeviceFifo {
        self.device_view
    }

    /// Host-visible twin of [`Proxy::device_fifo`] (loopback device and
    /// GPU-direct placements).
    pub fn host_fifo(&self) -> DeviceFifo {
        self.host_view
    }

    /// The fifo, when no service thread owns it (before start, after a
    /// joined shutdown).
    pub fn fifo(&self) -> Option<&TriggerFifo> {
        self.fifo.as_ref()
    }

    pub(crate) fn started(&self) -> bool {
        self.thread.is_some()
    }

    /// Set Running and hand the fifo to a freshly spawned, named
    /// service thread.
    pub(crate) fn spawn(
        &mut self,
        conns: Arc<Vec<Arc<dyn HostConnection>>>,
        device: Arc<dyn DeviceApi>,
        config: ProxyConfig,
        numa_node: Option<usize>,
    ) -> Result<()> {
        let fifo = self
            .fifo
            .take()
            .ok_or_else(|| TrigonError::device("proxy already started"))?;
        // Running must be observable before the thread's first check.
        self.run.store(RunState::Running);
        let ctx = ServiceContext {
            fifo,
            conns,
            device,
            config,
            run: Arc::clone(&self.run),
            p2p_stream: self.p2p_stream,
            numa_node,
            index: self.index,
        };
        let name = format!("trigon-{}-{:02}", self.transport.name(), self.index);
        let handle = std::thread::Builder::new()
            .name(name)
            .spawn(move || run_service(ctx))?;
        self.thread = Some(handle);
        Ok(())
    }

    pub(crate) fn request_exit(&self) {
        self.run.store(RunState::Exiting);
    }

    /// Join the finished service thread and take the fifo back.
    pub(crate) fn join(&mut self) {
        if let Some(handle) = self.thread.take() {
            match handle.join() {
                Ok(fifo) => self.fifo = Some(fifo),
                Err(_) => tracing::warn!(index = self.index, "proxy service thread panicked"),
            }
        }
    }

    /// Abandon the service thread (abort path). It keeps running
    /// detached and is reaped at process exit.
    pub(crate) fn detach(&mut self) {
        if self.thread.take().is_some() {
            tracing::warn!(
                index = self.index,
                transport = %self.transport,
                "abandoning proxy service thread on abort"
            );
        }
    }
}

struct ServiceContext {
    fifo: TriggerFifo,
    conns: Arc<Vec<Arc<dyn HostConnection>>>,
    device: Arc<dyn DeviceApi>,
    config: ProxyConfig,
    run: Arc<RunFlag>,
    p2p_stream: Option<StreamHandle>,
    numa_node: Option<usize>,
    index: usize,
}

/// The service loop. Returns the fifo so the owner can inspect and free
/// it after join; an early return (dead proxy) leaves the run state
/// short of Idle, which is how upper layers notice.
fn run_service(mut ctx: ServiceContext) -> TriggerFifo {
    // From here on the thread stays close to the device.
    if let Some(node) = ctx.numa_node {
        if let Err(e) = numa::bind_to_node(node) {
            tracing::warn!(index = ctx.index, error = %e, "NUMA bind failed, continuing unpinned");
        }
    }

    let period = ctx.config.run_state_check_period;
    let mut run_cnt = period;
    let mut flush_cnt: u64 = 0;

    loop {
        if run_cnt == 0 {
            run_cnt = period;
            if ctx.run.load() != RunState::Running {
                break;
            }
        }
        run_cnt -= 1;

        let raw = ctx.fifo.poll();
        if raw.is_empty() {
            std::hint::spin_loop();
            continue;
        }
        let trigger = Trigger::decode(raw);

        let Some(conn) = ctx.conns.get(trigger.conn_id as usize) else {
            tracing::warn!(
                index = ctx.index,
                conn_id = trigger.conn_id,
                conns = ctx.conns.len(),
                "trigger names an unknown connection, proxy stopping"
            );
            return ctx.fifo;
        };

        match transport::dispatch(&trigger, conn.as_ref()) {
            Ok(()) => {}
            Err(e) if e.is_in_progress() => {}
            Err(e) => {
                tracing::warn!(index = ctx.index, error = %e, "transport error, proxy stopping");
                return ctx.fifo;
            }
        }

        ctx.fifo.pop();

        // Publish the tail every `flush_counter` dispatches so producers
        // make progress without SYNC traffic, and immediately when the
        // trigger asked to drain.
        flush_cnt += 1;
        if flush_cnt % ctx.config.flush_counter == 0 || trigger.ty.contains(TriggerType::SYNC) {
            if let Err(e) = ctx.fifo.flush_tail(false) {
                tracing::warn!(index = ctx.index, error = %e, "tail flush failed, proxy stopping");
                return ctx.fifo;
            }
        }
    }

    // Make sure the last tail is visible before the proxy goes quiet.
    if let Err(e) = ctx.fifo.flush_tail(true) {
        tracing::warn!(index = ctx.index, error = %e, "final tail flush failed");
        return ctx.fifo;
    }
    if let Some(stream) = ctx.p2p_stream {
        if let Err(e) = ctx.device.synchronize_stream(stream) {
            tracing::warn!(index = ctx.index, error = %e, "p2p stream sync failed at shutdown");
            return ctx.fifo;
        }
    }
    ctx.run.store(RunState::Idle);
    ctx.fifo
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_flag_round_trip() {
        let flag = RunFlag::new(RunState::Idle);
        assert_eq!(flag.load(), RunState::Idle);
        flag.store(RunState::Running);
        assert_eq!(flag.load(), RunState::Running);
        flag.store(RunState::Exiting);
        assert_eq!(flag.load(), RunState::Exiting);
    }

    #[test]
    fn test_spec_transport() {
        assert_eq!(ProxySpec::P2p { stream: 1 }.transport(), TransportType::P2p);
        assert_eq!(ProxySpec::Ib.transport(), TransportType::Ib);
    }
}
