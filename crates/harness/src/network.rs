use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use fieldsync_engine::{
    ClientConfig, EngineError, Request, Response, RetryConfig, SyncService, SyncTransport,
    TransportError, WireMessage,
};
use fieldsync_storage::SqliteClientStore;

use crate::device::TestDevice;
use crate::server::TestServer;

/// A failure injected into one exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// The request never reaches the server.
    Unavailable,
    /// The server processes the request but the reply is lost.
    DropResponse,
}

/// Queue of faults consumed one per exchange, shared between a transport and
/// the test driving it.
#[derive(Debug, Clone, Default)]
pub struct FaultPlan(Arc<Mutex<VecDeque<Fault>>>);

impl FaultPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, fault: Fault) {
        self.queue().push_back(fault);
    }

    pub fn push_n(&self, fault: Fault, count: usize) {
        let mut queue = self.queue();
        for _ in 0..count {
            queue.push_back(fault);
        }
    }

    pub fn clear(&self) {
        self.queue().clear();
    }

    pub fn pending(&self) -> usize {
        self.queue().len()
    }

    fn next(&self) -> Option<Fault> {
        self.queue().pop_front()
    }

    fn queue(&self) -> std::sync::MutexGuard<'_, VecDeque<Fault>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-process transport. Every request and response is encoded to
/// MessagePack and decoded again, as it would be on a real wire.
#[derive(Clone)]
pub struct LoopbackTransport {
    server: Arc<Mutex<SyncService>>,
    faults: FaultPlan,
    delivered: Arc<AtomicUsize>,
}

impl LoopbackTransport {
    pub fn new(server: Arc<Mutex<SyncService>>) -> Self {
        Self {
            server,
            faults: FaultPlan::new(),
            delivered: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn faults(&self) -> &FaultPlan {
        &self.faults
    }

    /// Requests that reached the server, including ones whose reply was dropped.
    pub fn delivered(&self) -> usize {
        self.delivered.load(Ordering::SeqCst)
    }
}

impl SyncTransport for LoopbackTransport {
    fn exchange(&self, request: &Request) -> Result<Response, EngineError> {
        let fault = self.faults.next();
        if fault == Some(Fault::Unavailable) {
            return Err(TransportError::Unavailable("injected: server unreachable".into()).into());
        }

        let bytes = request
            .to_msgpack()
            .map_err(|e| TransportError::Codec(e.to_string()))?;
        let reply = {
            let mut server = self.server.lock().unwrap_or_else(PoisonError::into_inner);
            self.delivered.fetch_add(1, Ordering::SeqCst);
            server.handle_bytes(&bytes)?
        };

        if fault == Some(Fault::DropResponse) {
            return Err(TransportError::Timeout("injected: response lost".into()).into());
        }
        Response::from_msgpack(&reply).map_err(|e| TransportError::Codec(e.to_string()).into())
    }
}

/// One server and the devices talking to it.
pub struct TestNetwork {
    server: TestServer,
    devices: Vec<TestDevice>,
}

impl TestNetwork {
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        crate::init_tracing();
        Ok(Self {
            server: TestServer::new()?,
            devices: Vec::new(),
        })
    }

    pub fn with_server(server: TestServer) -> Self {
        crate::init_tracing();
        Self {
            server,
            devices: Vec::new(),
        }
    }

    pub fn server(&self) -> &TestServer {
        &self.server
    }

    /// Add a device with millisecond retry delays.
    pub fn add_device(&mut self) -> Result<usize, Box<dyn std::error::Error>> {
        let retry = RetryConfig::new(3)
            .with_initial_delay(Duration::from_millis(1))
            .with_jitter(false);
        self.add_device_with(ClientConfig::default().with_retry(retry))
    }

    pub fn add_device_with(
        &mut self,
        config: ClientConfig,
    ) -> Result<usize, Box<dyn std::error::Error>> {
        let transport = LoopbackTransport::new(self.server.shared());
        let device = TestDevice::new(SqliteClientStore::open_in_memory()?, transport, config);
        let index = self.devices.len();
        self.devices.push(device);
        Ok(index)
    }

    pub fn device(&self, index: usize) -> &TestDevice {
        &self.devices[index]
    }

    pub fn device_mut(&mut self, index: usize) -> &mut TestDevice {
        &mut self.devices[index]
    }
}
