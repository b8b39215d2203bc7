/// Modbus TCP server implementation
///
/// Serves the four read tables straight from the [`DataStore`] and routes
/// every write through the registered [`WriteObserver`] (the relay
/// bridge). The server owns framing and dispatch only; all relay
/// semantics live behind the observer.
///
/// The protocol layer dispatches one request at a time per connection,
/// so the observer's write path runs synchronously inside the connection
/// task. A stalled bus retry therefore stalls that client's requests,
/// matching the reference behavior.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};
use tokio::time::timeout;
use log::{debug, error, info, warn};

use crate::bridge::WriteObserver;
use crate::data_store::{DataStore, DataStoreStats};
use crate::error::{CouplerError, CouplerResult};
use crate::protocol::{decode_coil_value, pack_coils, unpack_coils, ModbusException};

/// Maximum frame size for Modbus TCP
const MAX_TCP_FRAME_SIZE: usize = 260;

/// MBAP header size
const MBAP_HEADER_SIZE: usize = 6;

/// Modbus server trait
#[async_trait]
pub trait ModbusServer: Send + Sync {
    /// Start the server
    async fn start(&mut self) -> CouplerResult<()>;

    /// Stop the server
    async fn stop(&mut self) -> CouplerResult<()>;

    /// Check if server is running
    fn is_running(&self) -> bool;

    /// Get server statistics
    async fn get_stats(&self) -> ServerStats;

    /// Get data store reference
    fn get_data_store(&self) -> Arc<DataStore>;
}

/// Server statistics
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub connections_count: u64,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub uptime_seconds: u64,
    pub data_store_stats: Option<DataStoreStats>,
}

/// Modbus TCP server configuration
#[derive(Clone)]
pub struct ModbusTcpServerConfig {
    pub bind_address: SocketAddr,
    pub max_connections: usize,
    pub request_timeout: Duration,
    pub data_store: Option<Arc<DataStore>>,
    /// Observer invoked for every write; `None` makes this a plain
    /// data-store server (useful in tests)
    pub write_observer: Option<Arc<dyn WriteObserver>>,
}

impl Default for ModbusTcpServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:502".parse().unwrap(),
            max_connections: 32,
            request_timeout: Duration::from_secs(30),
            data_store: None,
            write_observer: None,
        }
    }
}

/// Shared per-request context
struct ServerContext {
    store: Arc<DataStore>,
    observer: Option<Arc<dyn WriteObserver>>,
}

/// Modbus TCP server
pub struct ModbusTcpServer {
    config: ModbusTcpServerConfig,
    context: Arc<ServerContext>,
    stats: Arc<Mutex<ServerStats>>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    is_running: Arc<AtomicBool>,
    start_time: Option<std::time::Instant>,
}

impl ModbusTcpServer {
    /// Create a new TCP server with default configuration
    pub fn new(bind_address: &str) -> CouplerResult<Self> {
        let addr = bind_address
            .parse()
            .map_err(|e| CouplerError::configuration(format!("Invalid bind address: {}", e)))?;

        let config = ModbusTcpServerConfig {
            bind_address: addr,
            ..Default::default()
        };

        Self::with_config(config)
    }

    /// Create a new TCP server with custom configuration
    pub fn with_config(config: ModbusTcpServerConfig) -> CouplerResult<Self> {
        let store = config
            .data_store
            .clone()
            .unwrap_or_else(|| Arc::new(DataStore::new()));

        let context = Arc::new(ServerContext {
            store,
            observer: config.write_observer.clone(),
        });

        Ok(Self {
            config,
            context,
            stats: Arc::new(Mutex::new(ServerStats::default())),
            shutdown_tx: None,
            is_running: Arc::new(AtomicBool::new(false)),
            start_time: None,
        })
    }

    /// Handle client connection
    async fn handle_client(
        stream: TcpStream,
        context: Arc<ServerContext>,
        stats: Arc<Mutex<ServerStats>>,
        mut shutdown_rx: broadcast::Receiver<()>,
        request_timeout: Duration,
    ) {
        let peer_addr = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        info!("New client connected: {}", peer_addr);

        {
            let mut stats = stats.lock().await;
            stats.connections_count += 1;
        }

        let mut stream = stream;

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!("Shutdown signal received for client {}", peer_addr);
                    break;
                }

                result = timeout(request_timeout, Self::read_frame(&mut stream)) => {
                    match result {
                        Ok(Ok(None)) => {
                            debug!("Client {} disconnected", peer_addr);
                            break;
                        }
                        Ok(Ok(Some(frame))) => {
                            {
                                let mut stats = stats.lock().await;
                                stats.total_requests += 1;
                                stats.bytes_received += frame.len() as u64;
                            }

                            match Self::process_request(&frame, &context).await {
                                Ok(response_data) => {
                                    if let Err(e) = stream.write_all(&response_data).await {
                                        error!("Failed to send response to {}: {}", peer_addr, e);
                                        break;
                                    }
                                    let mut stats = stats.lock().await;
                                    stats.successful_requests += 1;
                                    stats.bytes_sent += response_data.len() as u64;
                                }
                                Err(e) => {
                                    // framing errors cannot be answered; anything
                                    // else maps to a Modbus exception response
                                    warn!("Request from {} failed: {}", peer_addr, e);

                                    let exception = ModbusException::from_error(&e);
                                    match Self::create_exception_response(&frame, exception) {
                                        Ok(response) => {
                                            let _ = stream.write_all(&response).await;
                                        }
                                        Err(frame_err) => {
                                            debug!("Dropping unanswerable frame from {}: {}", peer_addr, frame_err);
                                        }
                                    }

                                    let mut stats = stats.lock().await;
                                    stats.failed_requests += 1;
                                }
                            }
                        }
                        Ok(Err(e)) => {
                            // a framing error means the stream position is
                            // lost; drop the connection instead of guessing
                            error!("Read error from {}: {}", peer_addr, e);
                            break;
                        }
                        Err(_) => {
                            warn!("Read timeout from {}", peer_addr);
                            break;
                        }
                    }
                }
            }
        }

        info!("Client {} disconnected", peer_addr);
    }

    /// Read one complete MBAP-framed request from the stream
    ///
    /// TCP delivers byte streams, not frames: a request can arrive
    /// fragmented across segments or coalesced with the next one. Reads
    /// exactly one header, then exactly the advertised body length.
    /// Returns `None` when the peer closed the connection between frames.
    async fn read_frame<R>(stream: &mut R) -> CouplerResult<Option<Vec<u8>>>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; MBAP_HEADER_SIZE];
        match stream.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(CouplerError::io(e.to_string())),
        }

        // length counts the unit identifier and the PDU
        let length = u16::from_be_bytes([header[4], header[5]]) as usize;
        if length < 2 || MBAP_HEADER_SIZE + length > MAX_TCP_FRAME_SIZE {
            return Err(CouplerError::frame(format!("Invalid MBAP length: {}", length)));
        }

        let mut frame = vec![0u8; MBAP_HEADER_SIZE + length];
        frame[..MBAP_HEADER_SIZE].copy_from_slice(&header);
        stream
            .read_exact(&mut frame[MBAP_HEADER_SIZE..])
            .await
            .map_err(|e| CouplerError::io(format!("Connection closed mid-frame: {}", e)))?;

        Ok(Some(frame))
    }

    /// Process one Modbus TCP request frame
    async fn process_request(frame: &[u8], context: &ServerContext) -> CouplerResult<Vec<u8>> {
        if frame.len() < MBAP_HEADER_SIZE + 2 {
            return Err(CouplerError::frame("Frame too short"));
        }

        // Parse MBAP header
        let transaction_id = u16::from_be_bytes([frame[0], frame[1]]);
        let protocol_id = u16::from_be_bytes([frame[2], frame[3]]);
        let length = u16::from_be_bytes([frame[4], frame[5]]);
        let unit_id = frame[6];
        let function_code = frame[7];

        if protocol_id != 0 {
            return Err(CouplerError::frame("Invalid protocol ID"));
        }

        // length counts the unit identifier and the PDU
        if length < 2 || frame.len() < MBAP_HEADER_SIZE + length as usize {
            return Err(CouplerError::frame("Incomplete frame"));
        }

        debug!(
            "Processing request: TID={}, Function=0x{:02X}, Unit={}",
            transaction_id, function_code, unit_id
        );

        let data = &frame[MBAP_HEADER_SIZE + 2..MBAP_HEADER_SIZE + length as usize];

        let response_data = match function_code {
            0x01 => Self::handle_read_coils(data, context)?,
            0x02 => Self::handle_read_discrete_inputs(data, context)?,
            0x03 => Self::handle_read_holding_registers(data, context)?,
            0x04 => Self::handle_read_input_registers(data, context)?,
            0x05 => Self::handle_write_single_coil(data, context).await?,
            0x06 => Self::handle_write_single_register(data, context).await?,
            0x0F => Self::handle_write_multiple_coils(data, context).await?,
            0x10 => Self::handle_write_multiple_registers(data, context).await?,
            _ => return Err(CouplerError::invalid_function(function_code)),
        };

        // Response frame: MBAP header + PDU
        let response_length = response_data.len() + 2;
        let mut response = Vec::with_capacity(MBAP_HEADER_SIZE + response_length);

        response.extend_from_slice(&transaction_id.to_be_bytes());
        response.extend_from_slice(&protocol_id.to_be_bytes());
        response.extend_from_slice(&(response_length as u16).to_be_bytes());
        response.push(unit_id);
        response.push(function_code);
        response.extend_from_slice(&response_data);

        Ok(response)
    }

    fn parse_address_quantity(data: &[u8]) -> CouplerResult<(u16, u16)> {
        if data.len() < 4 {
            return Err(CouplerError::frame("Request data too short"));
        }
        let address = u16::from_be_bytes([data[0], data[1]]);
        let quantity = u16::from_be_bytes([data[2], data[3]]);
        Ok((address, quantity))
    }

    /// Handle read coils (0x01)
    fn handle_read_coils(data: &[u8], context: &ServerContext) -> CouplerResult<Vec<u8>> {
        let (address, quantity) = Self::parse_address_quantity(data)?;
        let coils = context.store.read_01(address, quantity)?;

        let packed = pack_coils(&coils);
        let mut response = vec![packed.len() as u8];
        response.extend_from_slice(&packed);
        Ok(response)
    }

    /// Handle read discrete inputs (0x02)
    fn handle_read_discrete_inputs(data: &[u8], context: &ServerContext) -> CouplerResult<Vec<u8>> {
        let (address, quantity) = Self::parse_address_quantity(data)?;
        let inputs = context.store.read_02(address, quantity)?;

        let packed = pack_coils(&inputs);
        let mut response = vec![packed.len() as u8];
        response.extend_from_slice(&packed);
        Ok(response)
    }

    /// Handle read holding registers (0x03)
    fn handle_read_holding_registers(data: &[u8], context: &ServerContext) -> CouplerResult<Vec<u8>> {
        let (address, quantity) = Self::parse_address_quantity(data)?;
        let registers = context.store.read_03(address, quantity)?;

        let mut response = vec![(registers.len() * 2) as u8];
        for register in registers {
            response.extend_from_slice(&register.to_be_bytes());
        }
        Ok(response)
    }

    /// Handle read input registers (0x04)
    fn handle_read_input_registers(data: &[u8], context: &ServerContext) -> CouplerResult<Vec<u8>> {
        let (address, quantity) = Self::parse_address_quantity(data)?;
        let registers = context.store.read_04(address, quantity)?;

        let mut response = vec![(registers.len() * 2) as u8];
        for register in registers {
            response.extend_from_slice(&register.to_be_bytes());
        }
        Ok(response)
    }

    /// Handle write single coil (0x05)
    async fn handle_write_single_coil(data: &[u8], context: &ServerContext) -> CouplerResult<Vec<u8>> {
        let (address, raw) = Self::parse_address_quantity(data)?;
        let value = decode_coil_value(raw)?;

        match &context.observer {
            Some(observer) => {
                // the observer mutates the relay bank and mirrors the
                // accepted value into the store
                observer
                    .on_write(
                        crate::protocol::ModbusFunction::WriteSingleCoil,
                        address,
                        &[value as u16],
                    )
                    .await?;
            }
            None => context.store.write_05(address, value)?,
        }

        // Echo back the request
        Ok(data[0..4].to_vec())
    }

    /// Handle write single register (0x06)
    async fn handle_write_single_register(data: &[u8], context: &ServerContext) -> CouplerResult<Vec<u8>> {
        let (address, value) = Self::parse_address_quantity(data)?;

        match &context.observer {
            Some(observer) => {
                observer
                    .on_write(
                        crate::protocol::ModbusFunction::WriteSingleRegister,
                        address,
                        &[value],
                    )
                    .await?;
            }
            None => context.store.write_06(address, value)?,
        }

        Ok(data[0..4].to_vec())
    }

    /// Handle write multiple coils (0x0F)
    async fn handle_write_multiple_coils(data: &[u8], context: &ServerContext) -> CouplerResult<Vec<u8>> {
        let (address, quantity) = Self::parse_address_quantity(data)?;
        if data.len() < 5 {
            return Err(CouplerError::frame("Request data too short"));
        }
        let byte_count = data[4] as usize;
        if data.len() < 5 + byte_count {
            return Err(CouplerError::frame("Incomplete write multiple coils request"));
        }

        let coils = unpack_coils(&data[5..5 + byte_count], quantity);

        match &context.observer {
            Some(observer) => {
                let values: Vec<u16> = coils.iter().map(|&c| c as u16).collect();
                observer
                    .on_write(
                        crate::protocol::ModbusFunction::WriteMultipleCoils,
                        address,
                        &values,
                    )
                    .await?;
            }
            None => context.store.write_0f(address, &coils)?,
        }

        // Return address and quantity
        Ok(data[0..4].to_vec())
    }

    /// Handle write multiple registers (0x10)
    async fn handle_write_multiple_registers(data: &[u8], context: &ServerContext) -> CouplerResult<Vec<u8>> {
        let (address, quantity) = Self::parse_address_quantity(data)?;
        if data.len() < 5 {
            return Err(CouplerError::frame("Request data too short"));
        }
        let byte_count = data[4] as usize;
        if data.len() < 5 + byte_count || byte_count != quantity as usize * 2 {
            return Err(CouplerError::frame("Incomplete write multiple registers request"));
        }

        let mut registers = Vec::with_capacity(quantity as usize);
        for i in 0..quantity as usize {
            let offset = 5 + i * 2;
            registers.push(u16::from_be_bytes([data[offset], data[offset + 1]]));
        }

        match &context.observer {
            Some(observer) => {
                observer
                    .on_write(
                        crate::protocol::ModbusFunction::WriteMultipleRegisters,
                        address,
                        &registers,
                    )
                    .await?;
            }
            None => context.store.write_10(address, &registers)?,
        }

        Ok(data[0..4].to_vec())
    }

    /// Create an exception response for a failed request
    fn create_exception_response(
        request: &[u8],
        exception: ModbusException,
    ) -> CouplerResult<Vec<u8>> {
        if request.len() < MBAP_HEADER_SIZE + 2 {
            return Err(CouplerError::frame("Request too short for exception response"));
        }

        let transaction_id = u16::from_be_bytes([request[0], request[1]]);
        let protocol_id = 0u16;
        let length = 3u16; // unit_id + function_code + exception_code
        let unit_id = request[6];
        let function_code = request[7] | 0x80; // Set exception bit

        let mut response = Vec::with_capacity(MBAP_HEADER_SIZE + 3);
        response.extend_from_slice(&transaction_id.to_be_bytes());
        response.extend_from_slice(&protocol_id.to_be_bytes());
        response.extend_from_slice(&length.to_be_bytes());
        response.push(unit_id);
        response.push(function_code);
        response.push(exception.to_u8());

        Ok(response)
    }
}

#[async_trait]
impl ModbusServer for ModbusTcpServer {
    async fn start(&mut self) -> CouplerResult<()> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(CouplerError::protocol("Server is already running"));
        }

        info!("Starting Modbus TCP server on {}", self.config.bind_address);

        let listener = TcpListener::bind(self.config.bind_address).await.map_err(|e| {
            CouplerError::connection(format!(
                "Failed to bind to {}: {}",
                self.config.bind_address, e
            ))
        })?;

        let (shutdown_tx, _) = broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx.clone());
        self.start_time = Some(std::time::Instant::now());
        self.is_running.store(true, Ordering::SeqCst);

        info!("Modbus TCP server started");
        info!("   - Bind address: {}", self.config.bind_address);
        info!("   - Max connections: {}", self.config.max_connections);
        info!("   - Request timeout: {:?}", self.config.request_timeout);

        let context = self.context.clone();
        let stats = self.stats.clone();
        let request_timeout = self.config.request_timeout;
        let is_running = self.is_running.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, addr)) => {
                                debug!("Accepted connection from {}", addr);

                                let context = context.clone();
                                let stats = stats.clone();
                                let shutdown_rx = shutdown_tx.subscribe();

                                tokio::spawn(async move {
                                    Self::handle_client(stream, context, stats, shutdown_rx, request_timeout).await;
                                });
                            }
                            Err(e) => {
                                error!("Failed to accept connection: {}", e);
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Shutdown signal received, stopping server");
                        break;
                    }
                }
            }

            is_running.store(false, Ordering::SeqCst);
        });

        Ok(())
    }

    async fn stop(&mut self) -> CouplerResult<()> {
        if let Some(shutdown_tx) = &self.shutdown_tx {
            let _ = shutdown_tx.send(());
        }

        self.is_running.store(false, Ordering::SeqCst);

        info!("Modbus TCP server stopped");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    async fn get_stats(&self) -> ServerStats {
        let mut stats = self.stats.lock().await.clone();

        if let Some(start_time) = self.start_time {
            stats.uptime_seconds = start_time.elapsed().as_secs();
        }
        stats.data_store_stats = Some(self.context.store.get_stats());
        stats
    }

    fn get_data_store(&self) -> Arc<DataStore> {
        self.context.store.clone()
    }
}
