//! Server network layer: UDP receive task, tick loop and outbound delivery

use crate::accounts::{AccountDirectory, GameStore};
use crate::dispatch::{Dispatcher, Outcome};
use log::{debug, error, info, warn};
use shared::{OutgoingMessage, ProtocolError, Transport, DEFAULT_VIABILITY, MAX_DATAGRAM_SIZE, RESEND_INTERVAL};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Game ticks per second
    pub tick_rate: u32,
    pub resend_interval: Duration,
    /// Viability of commands pushed to clients
    pub viability: Duration,
}

impl ServerConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn tick_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_rate.max(1) as f64)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            tick_rate: 20,
            resend_interval: RESEND_INTERVAL,
            viability: DEFAULT_VIABILITY,
        }
    }
}

/// Messages sent from network tasks to the main server loop
#[derive(Debug)]
pub enum ServerMessage {
    DatagramReceived { bytes: Vec<u8>, addr: SocketAddr },
    Shutdown,
}

/// Main server coordinating the socket, the dispatcher and the game tick
pub struct Server {
    transport: Transport,
    dispatcher: Dispatcher,
    tick_duration: Duration,
    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
    tasks: Vec<JoinHandle<()>>,
}

impl Server {
    pub async fn new(
        config: &ServerConfig,
        accounts: Arc<dyn AccountDirectory>,
        store: Arc<dyn GameStore>,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let transport = Transport::bind(&config.address(), config.resend_interval).await?;
        info!("Server listening on {}", transport.local_addr()?);

        let dispatcher = Dispatcher::new(accounts, store)?.with_viability(config.viability);
        let (server_tx, server_rx) = mpsc::unbounded_channel();

        Ok(Server {
            transport,
            dispatcher,
            tick_duration: config.tick_duration(),
            server_tx,
            server_rx,
            tasks: Vec::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ProtocolError> {
        self.transport.local_addr()
    }

    pub fn dispatcher_mut(&mut self) -> &mut Dispatcher {
        &mut self.dispatcher
    }

    /// Sender that can stop [`run`](Self::run) with [`ServerMessage::Shutdown`].
    pub fn handle(&self) -> mpsc::UnboundedSender<ServerMessage> {
        self.server_tx.clone()
    }

    /// Spawns task that continuously listens for incoming datagrams
    fn spawn_network_receiver(&mut self) {
        let transport = self.transport.clone();
        let server_tx = self.server_tx.clone();

        self.tasks.push(tokio::spawn(async move {
            let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];

            loop {
                match transport.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        let message = ServerMessage::DatagramReceived {
                            bytes: buffer[..len].to_vec(),
                            addr,
                        };
                        if let Err(e) = server_tx.send(message) {
                            error!("Failed to send datagram to main loop: {}", e);
                            break;
                        }
                    }
                    Err(e) => {
                        error!("Error receiving datagram: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        }));
    }

    async fn deliver(&self, sends: Vec<(SocketAddr, OutgoingMessage)>) {
        for (addr, message) in sends {
            let kind = message.kind();
            match self.transport.send(addr, message).await {
                Ok(Some(delivery)) => {
                    tokio::spawn(async move {
                        if let Err(e) = delivery.wait().await {
                            debug!("{} to {} not acknowledged: {}", kind, addr, e);
                        }
                    });
                }
                Ok(None) => {}
                Err(e) => error!("Failed to send {} to {}: {}", kind, addr, e),
            }
        }
    }

    async fn handle_datagram(&mut self, bytes: Vec<u8>, addr: SocketAddr) {
        let Outcome { sends, ack } = self.dispatcher.handle(&bytes, addr, Instant::now());

        if let Some(ack) = ack {
            if let Some(message_id) = ack.ack_message_id {
                match self.transport.take_pending(&message_id).await {
                    Some(pending) => {
                        debug!(
                            "{} to {} acked after {} attempt(s)",
                            pending.kind(),
                            pending.addr(),
                            pending.attempts()
                        );
                        pending.resolve(ack)
                    }
                    None => debug!("Ack for {} arrived after its record was settled", message_id),
                }
            }
        }

        self.deliver(sends).await;
    }

    /// Main server loop. Returns after a shutdown message.
    pub async fn run(&mut self) -> Result<(), ProtocolError> {
        self.spawn_network_receiver();
        self.tasks.push(self.transport.spawn_retry_loop());

        let mut tick_interval = interval(self.tick_duration);
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut ticks: u64 = 0;

        info!("Server started successfully");

        loop {
            tokio::select! {
                message = self.server_rx.recv() => {
                    match message {
                        Some(ServerMessage::DatagramReceived { bytes, addr }) => {
                            self.handle_datagram(bytes, addr).await;
                        }
                        Some(ServerMessage::Shutdown) | None => {
                            info!("Server shutting down");
                            break;
                        }
                    }
                },

                _ = tick_interval.tick() => {
                    let sends = self.dispatcher.tick(Instant::now());
                    self.deliver(sends).await;
                    ticks += 1;

                    if ticks % 200 == 0 {
                        let sessions: usize = self
                            .dispatcher
                            .games()
                            .iter()
                            .map(|game| game.session_count())
                            .sum();
                        debug!(
                            "Tick {}: {} game(s), {} session(s), {} pending send(s)",
                            ticks,
                            self.dispatcher.games().len(),
                            sessions,
                            self.transport.pending_count().await
                        );
                    }
                },
            }
        }

        for task in self.tasks.drain(..) {
            task.abort();
        }
        let pending = self.transport.pending_count().await;
        if pending > 0 {
            warn!("Abandoning {} unacknowledged message(s)", pending);
        }
        self.transport.close().await;
        Ok(())
    }
}
