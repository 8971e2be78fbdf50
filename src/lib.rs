//! GPU-driven host proxy.
//!
//! GPU kernels cannot open sockets or post RDMA work requests. Trigon
//! bridges that gap: kernels enqueue fixed-size *triggers* into a
//! device-visible SPSC ring, and a dedicated, NUMA-pinned CPU service
//! thread drains the ring, executing each trigger against a host-side
//! transport: peer-to-peer GPU copies within a host, or RDMA over
//! InfiniBand/RoCE.
//!
//! The crate covers the proxy machinery only: the trigger fifo and its
//! two memory placements, the service loop, transport dispatch, and the
//! spin/poll primitives both sides wait with. Connection bootstrap, IB
//! queue-pair construction and the collective algorithms that produce
//! triggers live with the caller.
//!
//! # Features
//!
//! - **cuda** — CUDA backend for device memory, pinned host memory and
//!   streams (cudarc)
//! - **gpudirect** — GPU-mapped host memory for the zero-copy fifo
//!   placement (implies `cuda`)
//! - **ib** — InfiniBand/RoCE transport via raw ibverbs FFI

pub mod comm;
pub mod config;
pub mod device;
pub mod error;
pub mod fifo;
pub mod numa;
pub mod poll;
pub mod proxy;
pub mod transport;
pub mod trigger;
pub mod types;

pub use comm::{Communicator, CommunicatorBuilder};
pub use config::ProxyConfig;
pub use device::{DeviceApi, HostDevice, Mapped, StreamHandle};
pub use error::{Result, TrigonError};
pub use fifo::{DeviceFifo, FifoProducer, TriggerFifo};
pub use proxy::{Proxy, ProxySpec, RunState};
pub use transport::p2p::{P2pConnection, P2pPeerMemory};
pub use transport::HostConnection;
pub use trigger::{RawTrigger, Trigger, TriggerType};
pub use types::{ConnId, TransportType, MAX_CONNECTIONS};

#[cfg(feature = "cuda")]
pub use device::CudaDevice;

#[cfg(feature = "ib")]
pub use transport::ib::{IbConnection, IbLocalMemory, IbRemoteMemory, IbSignalCell};
