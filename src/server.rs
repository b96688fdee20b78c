//! TCP front end for the textual TMTC protocol.
//!
//! Every received chunk is published verbatim on `raw_tc`; every line on
//! `raw_tm` is written to every connected client. A `quit` on the bus stops
//! the accept loop.

use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::bus::{Message, MessageBus, RAW_TC, RAW_TM, QUIT};

const READ_CHUNK: usize = 4096;

pub struct TmtcServer {
    listener: TcpListener,
    bus: MessageBus,
}

impl TmtcServer {
    pub async fn bind(addr: &str, bus: MessageBus) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("🌐 TMTC server listening on {}", listener.local_addr()?);
        Ok(Self { listener, bus })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts clients until `quit` is published.
    pub async fn run(self) -> std::io::Result<()> {
        let (quit_tx, mut quit_rx) = watch::channel(false);
        let quit = self.bus.subscribe(QUIT, move |message| {
            if matches!(message, Message::Quit) {
                let _ = quit_tx.send(true);
            }
            Ok(())
        });

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        info!("🔗 Client connected: {}", addr);
                        let bus = self.bus.clone();
                        let client_quit = quit_rx.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_client(stream, bus, client_quit).await {
                                warn!("Client {} error: {}", addr, e);
                            }
                            info!("🔌 Client {} disconnected", addr);
                        });
                    }
                    Err(e) => error!("Failed to accept connection: {}", e),
                },
                _ = quit_rx.changed() => break,
            }
        }

        quit.cancel();
        info!("TMTC server stopped");
        Ok(())
    }
}

async fn handle_client(stream: TcpStream, bus: MessageBus, mut quit: watch::Receiver<bool>) -> std::io::Result<()> {
    let (mut reader, mut writer) = stream.into_split();

    let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();
    let telemetry = bus.subscribe(RAW_TM, move |message| {
        if let Message::Line(line) = message {
            // A closed receiver means the client is going away.
            let _ = line_tx.send(line.clone());
        }
        Ok(())
    });

    let writer_task = tokio::spawn(async move {
        while let Some(line) = line_rx.recv().await {
            if let Err(e) = writer.write_all(line.as_bytes()).await {
                warn!("Failed to send telemetry: {}", e);
                break;
            }
        }
    });

    let mut buf = vec![0u8; READ_CHUNK];
    let result = loop {
        let n = tokio::select! {
            read = reader.read(&mut buf) => match read {
                Ok(0) => break Ok(()),
                Ok(n) => n,
                Err(e) => break Err(e),
            },
            _ = quit.changed() => break Ok(()),
        };

        let chunk = buf[..n].to_vec();
        debug!(bytes = n, "📨 raw telecommand");
        let publisher = bus.clone();
        // Instrument round trips block, so publishing leaves the runtime.
        match tokio::task::spawn_blocking(move || publisher.publish(RAW_TC, Message::Raw(chunk))).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => error!("Telecommand processing error: {}", e),
            Err(e) => error!("Telecommand task failed: {}", e),
        }
    };

    // Cancelling drops the callback and its sender, so the writer
    // flushes what is queued and exits.
    telemetry.cancel();
    let _ = writer_task.await;
    result
}
