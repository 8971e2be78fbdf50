//! The communicator: connection table, abort flag, and the lifecycle of
//! every proxy attached to it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::ProxyConfig;
use crate::device::DeviceApi;
use crate::error::{Result, TrigonError};
use crate::proxy::{Proxy, ProxySpec, RunState};
use crate::transport::HostConnection;
use crate::types::MAX_CONNECTIONS;

/// Owns the connections, the abort flag and up to
/// [`ProxyConfig::max_proxies`] proxies.
///
/// The connection table is frozen at build time: triggers index into it
/// by `conn_id`, and a table that shifts under a running proxy would
/// redirect in-flight work.
pub struct Communicator {
    device: Arc<dyn DeviceApi>,
    config: ProxyConfig,
    conns: Arc<Vec<Arc<dyn HostConnection>>>,
    abort: Arc<AtomicBool>,
    numa_node: Option<usize>,
    proxies: Vec<Proxy>,
}

/// Builder for [`Communicator`].
pub struct CommunicatorBuilder {
    device: Arc<dyn DeviceApi>,
    config: ProxyConfig,
    conns: Vec<Arc<dyn HostConnection>>,
    numa_node: Option<usize>,
}

impl CommunicatorBuilder {
    pub fn new(device: Arc<dyn DeviceApi>) -> Self {
        let numa_node = device.numa_node();
        Self {
            device,
            config: ProxyConfig::default(),
            conns: Vec::new(),
            numa_node,
        }
    }

    pub fn config(mut self, config: ProxyConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the NUMA node service threads bind to (default: the
    /// device's own report).
    pub fn numa_node(mut self, node: usize) -> Self {
        self.numa_node = Some(node);
        self
    }

    /// Append an established connection; its index in the table is the
    /// `conn_id` triggers use to reach it.
    pub fn connection(mut self, conn: Arc<dyn HostConnection>) -> Self {
        self.conns.push(conn);
        self
    }

    pub fn build(self) -> Result<Communicator> {
        if self.conns.len() > MAX_CONNECTIONS {
            return Err(TrigonError::TooManyConnections {
                max: MAX_CONNECTIONS,
            });
        }
        Ok(Communicator {
            device: self.device,
            config: self.config,
            conns: Arc::new(self.conns),
            abort: Arc::new(AtomicBool::new(false)),
            numa_node: self.numa_node,
            proxies: Vec::new(),
        })
    }
}

impl Communicator {
    pub fn builder(device: Arc<dyn DeviceApi>) -> CommunicatorBuilder {
        CommunicatorBuilder::new(device)
    }

    /// Attach a proxy (allocating its fifo) without starting it.
    /// Returns the proxy's index.
    pub fn add_proxy(&mut self, spec: ProxySpec) -> Result<usize> {
        if self.proxies.len() >= self.config.max_proxies {
            return Err(TrigonError::TooManyProxies {
                max: self.config.max_proxies,
            });
        }
        let index = self.proxies.len();
        self.proxies
            .push(Proxy::create(index, spec, &self.device, &self.config)?);
        Ok(index)
    }

    /// Spawn a service thread for every proxy not yet started.
    pub fn start(&mut self) -> Result<()> {
        for proxy in &mut self.proxies {
            if proxy.started() {
                continue;
            }
            proxy.spawn(
                Arc::clone(&self.conns),
                Arc::clone(&self.device),
                self.config.clone(),
                self.numa_node,
            )?;
        }
        Ok(())
    }

    /// Stop every proxy.
    ///
    /// For each: skip if already Idle; otherwise request Exiting and
    /// sleep ~1 ms between reads until the service thread reports Idle
    /// or the abort flag fires. Idle threads are joined (their fifos
    /// become inspectable again via [`Communicator::proxy`]); on abort
    /// the thread is abandoned and reaped at process exit.
    pub fn shutdown(&mut self) {
        for proxy in &mut self.proxies {
            if !proxy.started() {
                continue;
            }
            if proxy.run_state() != RunState::Idle {
                proxy.request_exit();
                while proxy.run_state() == RunState::Exiting && !self.abort.load(Ordering::Acquire)
                {
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
            if proxy.run_state() == RunState::Idle {
                proxy.join();
            } else {
                proxy.detach();
            }
        }
    }

    /// The release hatch for callers that have given up on graceful
    /// shutdown: once set, [`Communicator::shutdown`] stops waiting.
    pub fn abort_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abort)
    }

    pub fn proxy(&self, index: usize) -> Option<&Proxy> {
        self.proxies.get(index)
    }

    pub fn proxy_count(&self) -> usize {
        self.proxies.len()
    }

    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }

    pub fn device(&self) -> &Arc<dyn DeviceApi> {
        &self.device
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }
}

impl Drop for Communicator {
    fn drop(&mut self) {
        self.shutdown();
    }
}
