//! Listener and worker-pool wiring.
//!
//! Connections are accepted on the tokio runtime; each inbound frame is
//! handed over a bounded channel to a fixed pool of worker threads that run
//! the (blocking) engine operation and push the response back to the
//! connection's writer task. Additional listeners can appear and disappear
//! at runtime through writes to `/apteryx/sockets/`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use apteryx_common::uri::Endpoint;
use apteryx_common::wire::{Request, Response};
use apteryx_common::{read_frame, write_frame};
use apteryx_db::{Engine, SocketManager, service};
use bytes::BytesMut;
use crossbeam::channel::{Receiver, Sender, bounded};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};

use crate::rpc::BlockingRpc;

/// Room for a burst of pipelined requests without unbounded memory.
const COMMAND_CHANNEL_SIZE: usize = 16_384;

struct Job {
    request: Request,
    resp: tokio::sync::mpsc::UnboundedSender<Response>,
}

pub struct Server {
    pub engine: Arc<Engine>,
}

impl Server {
    /// Build the engine, start `workers` threads and listen on every uri.
    pub async fn start(listen: &[String], workers: usize) -> std::io::Result<Server> {
        let engine = Arc::new(Engine::new(Arc::new(BlockingRpc)));

        let (cmd_tx, cmd_rx) = bounded::<Job>(COMMAND_CHANNEL_SIZE);
        for n in 0..workers.max(1) {
            let engine = engine.clone();
            let cmd_rx = cmd_rx.clone();
            std::thread::Builder::new()
                .name(format!("apteryx-worker-{n}"))
                .spawn(move || worker(engine, cmd_rx))?;
        }

        let manager = Listeners {
            handle: tokio::runtime::Handle::current(),
            cmd_tx: cmd_tx.clone(),
            active: Mutex::new(HashMap::new()),
        };
        for (n, target) in listen.iter().enumerate() {
            if !manager.bind(&format!("boot-{n}"), target) {
                return Err(std::io::Error::other(format!("cannot listen on {target}")));
            }
            log::info!("listening on {target}");
        }
        engine.set_socket_manager(Box::new(manager));

        Ok(Server { engine })
    }
}

fn worker(engine: Arc<Engine>, cmd_rx: Receiver<Job>) {
    while let Ok(job) = cmd_rx.recv() {
        let response = service::execute(&engine, job.request);
        // A closed channel just means the client hung up mid-request.
        let _ = job.resp.send(response);
    }
}

/// Live listeners, keyed by the guid they were registered under.
struct Listeners {
    handle: tokio::runtime::Handle,
    cmd_tx: Sender<Job>,
    active: Mutex<HashMap<String, tokio::task::JoinHandle<()>>>,
}

impl SocketManager for Listeners {
    fn bind(&self, guid: &str, target: &str) -> bool {
        let Ok(endpoint) = target.parse::<Endpoint>() else {
            log::warn!("not a listenable uri: {target}");
            return false;
        };
        let cmd_tx = self.cmd_tx.clone();
        let _entered = self.handle.enter();
        let task = match endpoint {
            Endpoint::Unix(path) => {
                let _ = std::fs::remove_file(&path);
                match UnixListener::bind(&path) {
                    Ok(listener) => self.handle.spawn(async move {
                        loop {
                            match listener.accept().await {
                                Ok((stream, _)) => {
                                    tokio::spawn(handle_connection(stream, cmd_tx.clone()));
                                }
                                Err(e) => {
                                    log::warn!("accept failed: {e}");
                                    break;
                                }
                            }
                        }
                    }),
                    Err(e) => {
                        log::warn!("cannot bind {target}: {e}");
                        return false;
                    }
                }
            }
            Endpoint::Tcp(addr) => {
                let std_listener = match std::net::TcpListener::bind(addr) {
                    Ok(listener) => listener,
                    Err(e) => {
                        log::warn!("cannot bind {target}: {e}");
                        return false;
                    }
                };
                if std_listener.set_nonblocking(true).is_err() {
                    return false;
                }
                let Ok(listener) = TcpListener::from_std(std_listener) else {
                    return false;
                };
                self.handle.spawn(async move {
                    loop {
                        match listener.accept().await {
                            Ok((stream, _)) => {
                                tokio::spawn(handle_connection(stream, cmd_tx.clone()));
                            }
                            Err(e) => {
                                log::warn!("accept failed: {e}");
                                break;
                            }
                        }
                    }
                })
            }
        };
        self.active.lock().unwrap().insert(guid.to_string(), task);
        true
    }

    fn release(&self, guid: &str) -> bool {
        match self.active.lock().unwrap().remove(guid) {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }
}

async fn handle_connection<S>(stream: S, cmd_tx: Sender<Job>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let (resp_tx, mut resp_rx) = tokio::sync::mpsc::unbounded_channel::<Response>();

    let write_task = tokio::spawn(async move {
        let mut buf = BytesMut::new();
        while let Some(response) = resp_rx.recv().await {
            if write_frame(&mut writer, &response, &mut buf).await.is_err() {
                break;
            }
        }
    });

    let mut read_buf = BytesMut::new();
    loop {
        let request: Request = match read_frame(&mut reader, &mut read_buf).await {
            Ok(request) => request,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::UnexpectedEof {
                    log::debug!("connection dropped: {e}");
                }
                break;
            }
        };
        if cmd_tx
            .send(Job {
                request,
                resp: resp_tx.clone(),
            })
            .is_err()
        {
            break;
        }
    }

    drop(resp_tx);
    let _ = write_task.await;
}
