/// Modbus TCP server
///
/// One listener per bound address. Every accepted connection runs in its own
/// task and loops over the states
///
/// ```text
/// AwaitingHeader -> AwaitingPDU -> Dispatching -> Responding -> AwaitingHeader
///        \______________\______________________________________-> Closed
/// ```
///
/// Bytes are buffered until a whole MBAP frame is available, every complete
/// frame is dispatched and answered in arrival order, and the connection is
/// closed on EOF, I/O errors, malformed MBAP headers or shutdown.

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use log::{debug, error, info, warn};

use crate::context::{DeviceContext, ServerContext};
use crate::dispatcher::dispatch;
use crate::error::{ModbusError, ModbusResult};
use crate::frame::{encode_exception, encode_frame, Frame};
use crate::logging::{log_packet, PacketDirection};
use crate::protocol::ModbusException;
use crate::{DEFAULT_TCP_PORT, MAX_TCP_FRAME_SIZE};

/// Modbus server trait
#[async_trait]
pub trait ModbusServer: Send + Sync {
    /// Bind and start accepting connections
    async fn start(&mut self) -> ModbusResult<()>;

    /// Stop accepting and close every open connection
    async fn stop(&mut self) -> ModbusResult<()>;

    /// Check if server is running
    fn is_running(&self) -> bool;

    /// Get server statistics
    fn get_stats(&self) -> ServerStats;

    /// Unit-id to device mapping served by this server
    fn context(&self) -> Arc<ServerContext>;
}

/// Server statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub connections_count: u64,
    pub active_connections: usize,
    pub rejected_connections: u64,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub exception_responses: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub uptime_seconds: u64,
}

#[derive(Debug, Default)]
pub(crate) struct ServerCounters {
    connections_count: AtomicU64,
    active_connections: AtomicUsize,
    rejected_connections: AtomicU64,
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    exception_responses: AtomicU64,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
}

impl ServerCounters {
    fn snapshot(&self) -> ServerStats {
        ServerStats {
            connections_count: self.connections_count.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            rejected_connections: self.rejected_connections.load(Ordering::Relaxed),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            successful_requests: self.successful_requests.load(Ordering::Relaxed),
            exception_responses: self.exception_responses.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            uptime_seconds: 0,
        }
    }
}

/// Modbus TCP server configuration
#[derive(Debug, Clone)]
pub struct ModbusTcpServerConfig {
    pub bind_address: SocketAddr,
    pub max_connections: usize,
    /// Close connections that send nothing for this long
    pub request_timeout: Option<Duration>,
    pub context: Option<Arc<ServerContext>>,
}

impl Default for ModbusTcpServerConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([127, 0, 0, 1], DEFAULT_TCP_PORT)),
            max_connections: 100,
            request_timeout: None,
            context: None,
        }
    }
}

/// Modbus TCP server implementation
pub struct ModbusTcpServer {
    config: ModbusTcpServerConfig,
    context: Arc<ServerContext>,
    counters: Arc<ServerCounters>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    is_running: Arc<AtomicBool>,
    start_time: Option<Instant>,
    local_addr: Option<SocketAddr>,
    accept_task: Option<JoinHandle<()>>,
}

impl ModbusTcpServer {
    /// Create a new TCP server with default configuration
    pub fn new(bind_address: &str) -> ModbusResult<Self> {
        let addr = bind_address.parse()
            .map_err(|e| ModbusError::configuration(format!("Invalid bind address: {}", e)))?;

        let config = ModbusTcpServerConfig {
            bind_address: addr,
            ..Default::default()
        };

        Ok(Self::with_config(config))
    }

    /// Create a new TCP server with custom configuration
    ///
    /// Without a context the server gets one fresh default device answering
    /// every unit id.
    pub fn with_config(config: ModbusTcpServerConfig) -> Self {
        let context = config.context.clone()
            .unwrap_or_else(|| Arc::new(ServerContext::single(1, Arc::new(DeviceContext::default()))));

        Self {
            config,
            context,
            counters: Arc::new(ServerCounters::default()),
            shutdown_tx: None,
            is_running: Arc::new(AtomicBool::new(false)),
            start_time: None,
            local_addr: None,
            accept_task: None,
        }
    }

    /// Configured bind address
    pub fn bind_address(&self) -> SocketAddr {
        self.config.bind_address
    }

    /// Address actually bound, once started
    ///
    /// Differs from the configured address when binding port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Handle client connection
    async fn handle_client(
        stream: TcpStream,
        peer_addr: SocketAddr,
        context: Arc<ServerContext>,
        counters: Arc<ServerCounters>,
        shutdown_rx: broadcast::Receiver<()>,
        request_timeout: Option<Duration>,
    ) {
        info!("New client connected: {}", peer_addr);
        let peer = peer_addr.to_string();

        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
        }

        match serve_connection(stream, &peer, &context, &counters, shutdown_rx, request_timeout).await {
            Ok(()) => debug!("Connection {} closed", peer),
            Err(e) if e.is_transport_error() => debug!("Connection {} dropped: {}", peer, e),
            Err(e) => warn!("Closing connection {}: {}", peer, e),
        }

        counters.active_connections.fetch_sub(1, Ordering::Relaxed);
        info!("Client {} disconnected", peer);
    }
}

/// Serve one client until EOF, error or shutdown
///
/// Requests are answered strictly in arrival order. Incomplete frames stay in
/// the buffer until the rest arrives; several frames arriving in one read are
/// all answered before reading again.
pub(crate) async fn serve_connection<S>(
    mut stream: S,
    peer: &str,
    context: &ServerContext,
    counters: &ServerCounters,
    mut shutdown_rx: broadcast::Receiver<()>,
    request_timeout: Option<Duration>,
) -> ModbusResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buffer = BytesMut::with_capacity(MAX_TCP_FRAME_SIZE);

    loop {
        loop {
            let (request, consumed) = match Frame::decode(&buffer) {
                Ok(decoded) => decoded,
                Err(e) if e.is_incomplete() => break,
                Err(e) => return Err(e),
            };

            log_packet(peer, PacketDirection::Received, &buffer[..consumed]);
            buffer.advance(consumed);
            counters.total_requests.fetch_add(1, Ordering::Relaxed);

            if let Some(response) = respond(context, counters, &request) {
                stream.write_all(&response).await?;
                counters.bytes_sent.fetch_add(response.len() as u64, Ordering::Relaxed);
                log_packet(peer, PacketDirection::Sent, &response);
            }
        }

        let bytes_read = tokio::select! {
            _ = shutdown_rx.recv() => {
                debug!("Shutdown signal received for client {}", peer);
                return Ok(());
            }
            result = read_request_bytes(&mut stream, &mut buffer, request_timeout) => result?,
        };

        if bytes_read == 0 {
            if !buffer.is_empty() {
                debug!("Client {} closed with {} unprocessed bytes", peer, buffer.len());
            }
            return Ok(());
        }
        counters.bytes_received.fetch_add(bytes_read as u64, Ordering::Relaxed);
    }
}

async fn read_request_bytes<S>(
    stream: &mut S,
    buffer: &mut BytesMut,
    request_timeout: Option<Duration>,
) -> ModbusResult<usize>
where
    S: AsyncRead + Unpin,
{
    match request_timeout {
        Some(limit) => timeout(limit, stream.read_buf(buffer))
            .await
            .map_err(|_| ModbusError::timeout("waiting for request", limit.as_millis() as u64))?
            .map_err(ModbusError::from),
        None => stream.read_buf(buffer).await.map_err(ModbusError::from),
    }
}

/// Build the response frame for one request
///
/// `None` means the request gets no answer (unit id not served here).
fn respond(context: &ServerContext, counters: &ServerCounters, request: &Frame) -> Option<Vec<u8>> {
    let Some(device) = context.resolve(request.unit_id) else {
        warn!("Ignoring request for unknown unit id {}", request.unit_id);
        return None;
    };

    debug!(
        "Processing request: TID={}, Function=0x{:02x}, Unit={}",
        request.transaction_id, request.function_code, request.unit_id
    );

    let result = dispatch(&device, request.function_code, &request.payload).and_then(|payload| {
        encode_frame(request.transaction_id, request.unit_id, request.function_code, &payload).map_err(|e| {
            error!("Failed to encode response: {}", e);
            ModbusException::SlaveDeviceFailure
        })
    });

    match result {
        Ok(response) => {
            counters.successful_requests.fetch_add(1, Ordering::Relaxed);
            Some(response)
        }
        Err(exception) => {
            counters.exception_responses.fetch_add(1, Ordering::Relaxed);
            Some(encode_exception(
                request.transaction_id,
                request.unit_id,
                request.function_code,
                exception,
            ))
        }
    }
}

#[async_trait]
impl ModbusServer for ModbusTcpServer {
    async fn start(&mut self) -> ModbusResult<()> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(ModbusError::protocol("Server is already running"));
        }

        debug!("Starting Modbus TCP server on {}", self.config.bind_address);

        let listener = TcpListener::bind(self.config.bind_address).await
            .map_err(|e| ModbusError::connection(format!("Failed to bind to {}: {}", self.config.bind_address, e)))?;
        let local_addr = listener.local_addr()?;

        let (shutdown_tx, _) = broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx.clone());
        self.start_time = Some(Instant::now());
        self.local_addr = Some(local_addr);
        self.is_running.store(true, Ordering::SeqCst);

        info!("server listening at {}", local_addr);
        debug!(
            "Server configuration: max connections {}, request timeout {:?}, unit ids {:?}",
            self.config.max_connections,
            self.config.request_timeout,
            self.context.unit_ids()
        );

        let context = self.context.clone();
        let counters = self.counters.clone();
        let request_timeout = self.config.request_timeout;
        let max_connections = self.config.max_connections;
        let is_running_flag = self.is_running.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();

        self.accept_task = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, addr)) => {
                                if counters.active_connections.load(Ordering::Relaxed) >= max_connections {
                                    warn!("Rejecting {}: connection limit {} reached", addr, max_connections);
                                    counters.rejected_connections.fetch_add(1, Ordering::Relaxed);
                                    drop(stream);
                                    continue;
                                }

                                counters.connections_count.fetch_add(1, Ordering::Relaxed);
                                counters.active_connections.fetch_add(1, Ordering::Relaxed);

                                let context = context.clone();
                                let counters = counters.clone();
                                let shutdown_rx = shutdown_tx.subscribe();

                                tokio::spawn(async move {
                                    Self::handle_client(stream, addr, context, counters, shutdown_rx, request_timeout).await;
                                });
                            }
                            Err(e) => {
                                error!("Failed to accept connection: {}", e);
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Shutdown signal received, stopping server at {}", local_addr);
                        break;
                    }
                }
            }

            is_running_flag.store(false, Ordering::SeqCst);
        }));

        Ok(())
    }

    async fn stop(&mut self) -> ModbusResult<()> {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }

        if let Some(accept_task) = self.accept_task.take() {
            accept_task.await
                .map_err(|e| ModbusError::internal(format!("Accept loop failed: {}", e)))?;
        }

        self.is_running.store(false, Ordering::SeqCst);
        info!("Modbus TCP server at {} stopped", self.config.bind_address);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    fn get_stats(&self) -> ServerStats {
        let mut stats = self.counters.snapshot();
        if let Some(start_time) = self.start_time {
            stats.uptime_seconds = start_time.elapsed().as_secs();
        }
        stats
    }

    fn context(&self) -> Arc<ServerContext> {
        self.context.clone()
    }
}

impl Drop for ModbusTcpServer {
    fn drop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::DeviceIdentification;
    use tokio_test::io::Builder;

    fn test_context() -> (Arc<DeviceContext>, ServerContext) {
        let device = Arc::new(DeviceContext::new(100, DeviceIdentification::default()));
        let context = ServerContext::single(1, device.clone());
        (device, context)
    }

    async fn run(stream: tokio_test::io::Mock, context: &ServerContext) -> (ModbusResult<()>, ServerStats) {
        let counters = ServerCounters::default();
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let result = serve_connection(stream, "test", context, &counters, shutdown_rx, None).await;
        (result, counters.snapshot())
    }

    #[tokio::test]
    async fn test_request_split_across_reads() {
        let (_device, context) = test_context();
        let request = encode_frame(0x0101, 1, 0x03, &[0x00, 0x00, 0x00, 0x01]).unwrap();
        let response = encode_frame(0x0101, 1, 0x03, &[0x02, 0x00, 0x00]).unwrap();

        let mock = Builder::new()
            .read(&request[..3])
            .read(&request[3..9])
            .read(&request[9..])
            .write(&response)
            .build();

        let (result, stats) = run(mock, &context).await;
        assert!(result.is_ok());
        assert_eq!(stats.total_requests, 1);
        assert_eq!(stats.successful_requests, 1);
        assert_eq!(stats.bytes_received, request.len() as u64);
        assert_eq!(stats.bytes_sent, response.len() as u64);
    }

    #[tokio::test]
    async fn test_pipelined_requests_answered_in_order() {
        let (device, context) = test_context();
        let mut requests = encode_frame(1, 1, 0x06, &[0x00, 0x00, 0x00, 0x2A]).unwrap();
        requests.extend(encode_frame(2, 1, 0x03, &[0x00, 0x00, 0x00, 0x01]).unwrap());
        requests.extend(encode_frame(3, 1, 0x01, &[0x00, 0x32, 0x00, 0x3C]).unwrap());

        let mock = Builder::new()
            .read(&requests)
            .write(&encode_frame(1, 1, 0x06, &[0x00, 0x00, 0x00, 0x2A]).unwrap())
            .write(&encode_frame(2, 1, 0x03, &[0x02, 0x00, 0x2A]).unwrap())
            .write(&encode_exception(3, 1, 0x01, ModbusException::IllegalDataAddress))
            .build();

        let (result, stats) = run(mock, &context).await;
        assert!(result.is_ok());
        assert_eq!(stats.total_requests, 3);
        assert_eq!(stats.exception_responses, 1);
        assert_eq!(device.registers().read_holding_registers(0, 1).unwrap(), vec![42]);
    }

    #[tokio::test]
    async fn test_store_failure_sends_exception_code_4() {
        let (device, context) = test_context();
        let registers = device.registers().clone();
        let poisoned = std::thread::spawn(move || {
            let _ = registers.update_holding_register(0, |_| panic!("store update failed"));
        })
        .join();
        assert!(poisoned.is_err());

        let request = encode_frame(0x0042, 1, 0x03, &[0x00, 0x00, 0x00, 0x01]).unwrap();
        let response = [0x00, 0x42, 0x00, 0x00, 0x00, 0x03, 0x01, 0x83, 0x04];
        assert_eq!(
            encode_exception(0x0042, 1, 0x03, ModbusException::SlaveDeviceFailure),
            response.to_vec()
        );

        let mock = Builder::new().read(&request).write(&response).build();
        let (result, stats) = run(mock, &context).await;
        assert!(result.is_ok());
        assert_eq!(stats.exception_responses, 1);
    }

    #[tokio::test]
    async fn test_invalid_protocol_id_closes_connection() {
        let (_device, context) = test_context();
        let bad = [0x00, 0x01, 0x00, 0x07, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x01];

        let mock = Builder::new().read(&bad).build();
        let (result, stats) = run(mock, &context).await;
        assert_eq!(result.unwrap_err(), ModbusError::invalid_protocol_id(7));
        assert_eq!(stats.total_requests, 0);
    }

    #[tokio::test]
    async fn test_unknown_unit_is_ignored() {
        let device = Arc::new(DeviceContext::default());
        let mut devices = std::collections::HashMap::new();
        devices.insert(1, device);
        let context = ServerContext::with_devices(devices);

        let mut requests = encode_frame(1, 9, 0x03, &[0x00, 0x00, 0x00, 0x01]).unwrap();
        requests.extend(encode_frame(2, 1, 0x03, &[0x00, 0x00, 0x00, 0x01]).unwrap());

        let mock = Builder::new()
            .read(&requests)
            .write(&encode_frame(2, 1, 0x03, &[0x02, 0x00, 0x00]).unwrap())
            .build();

        let (result, stats) = run(mock, &context).await;
        assert!(result.is_ok());
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.successful_requests, 1);
    }

    #[tokio::test]
    async fn test_shutdown_closes_idle_connection() {
        let (_device, context) = test_context();
        let counters = ServerCounters::default();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let (_client, server_side) = tokio::io::duplex(64);

        shutdown_tx.send(()).unwrap();
        let result = serve_connection(server_side, "test", &context, &counters, shutdown_rx, None).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_idle_timeout() {
        let (_device, context) = test_context();
        let counters = ServerCounters::default();
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let (_client, server_side) = tokio::io::duplex(64);

        let result = serve_connection(
            server_side,
            "test",
            &context,
            &counters,
            shutdown_rx,
            Some(Duration::from_millis(20)),
        )
        .await;
        assert!(matches!(result, Err(ModbusError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let mut server = ModbusTcpServer::new("127.0.0.1:0").unwrap();
        assert!(!server.is_running());

        server.start().await.unwrap();
        assert!(server.is_running());
        let addr = server.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
        assert!(server.start().await.is_err());

        server.stop().await.unwrap();
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let mut first = ModbusTcpServer::new("127.0.0.1:0").unwrap();
        first.start().await.unwrap();
        let taken = first.local_addr().unwrap();

        let mut second = ModbusTcpServer::new(&taken.to_string()).unwrap();
        let err = second.start().await.unwrap_err();
        assert!(matches!(err, ModbusError::Connection { .. }));
        assert!(!second.is_running());

        first.stop().await.unwrap();
    }
}
