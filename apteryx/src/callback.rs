//! Callback delivery.
//!
//! The daemon invokes callbacks by connecting back to this process's
//! listener socket (`unix:///tmp/apteryx.<pid>`) and sending ordinary
//! request frames. However many connections the daemon opens, every
//! invocation funnels through one consumer so a client observes its
//! callbacks serialised:
//!
//! - **threaded** (default): a dedicated executor thread runs handlers in
//!   arrival order;
//! - **manual**: invocations queue in memory, a byte on the signal socket
//!   marks the queue non-empty, and the application calls
//!   [`Apteryx::process_one`](crate::Apteryx::process_one) from its own
//!   loop to execute exactly one.

use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, mpsc};

use apteryx_common::error::AptError;
use apteryx_common::wire::{PathList, Request, Response, TreeMsg, request, response};
use apteryx_common::{code, read_frame, uri, write_frame};
use bytes::{Bytes, BytesMut};
use tokio::net::UnixListener;

pub(crate) enum HandlerFn {
    Watch(Box<dyn Fn(&str, Option<&Bytes>) + Send + Sync>),
    WatchTree(Box<dyn Fn(&TreeMsg) + Send + Sync>),
    Validate(Box<dyn Fn(&str, Option<&Bytes>) -> i32 + Send + Sync>),
    Refresh(Box<dyn Fn(&str) -> u64 + Send + Sync>),
    Provide(Box<dyn Fn(&str) -> Option<Bytes> + Send + Sync>),
    Index(Box<dyn Fn(&str) -> Vec<String> + Send + Sync>),
}

pub(crate) enum Mode {
    Threaded,
    Manual,
}

struct Job {
    id: u64,
    action: request::Action,
    done: tokio::sync::oneshot::Sender<Response>,
}

/// Manual-mode queue: the in-memory list is authoritative, the socket pair
/// only signals readiness. If the signal buffer ever fills the job still
/// sits in the list and is drained in arrival order.
struct DrainQueue {
    jobs: Mutex<VecDeque<Job>>,
    signal_tx: Mutex<std::os::unix::net::UnixStream>,
    signal_rx: Mutex<std::os::unix::net::UnixStream>,
    fd: RawFd,
}

impl DrainQueue {
    fn new() -> std::io::Result<DrainQueue> {
        let (tx, rx) = std::os::unix::net::UnixStream::pair()?;
        tx.set_nonblocking(true)?;
        rx.set_nonblocking(true)?;
        let fd = rx.as_raw_fd();
        Ok(DrainQueue {
            jobs: Mutex::new(VecDeque::new()),
            signal_tx: Mutex::new(tx),
            signal_rx: Mutex::new(rx),
            fd,
        })
    }

    fn push(&self, job: Job) {
        self.jobs.lock().unwrap().push_back(job);
        let mut tx = self.signal_tx.lock().unwrap();
        // A full pipe is fine: the queue spills in memory.
        let _ = tx.write(&[1]);
    }

    fn pop(&self) -> Option<Job> {
        let job = self.jobs.lock().unwrap().pop_front()?;
        let mut rx = self.signal_rx.lock().unwrap();
        let _ = rx.read(&mut [0u8; 1]);
        Some(job)
    }
}

pub(crate) struct CallbackService {
    handlers: Mutex<HashMap<u64, Arc<HandlerFn>>>,
    next_ref: AtomicU64,
    mode: Mode,
    queue: Option<DrainQueue>,
    executor_tx: Mutex<Option<mpsc::Sender<Job>>>,
    listener: tokio::sync::Mutex<bool>,
}

impl CallbackService {
    pub(crate) fn new(mode: Mode) -> std::io::Result<CallbackService> {
        let queue = match mode {
            Mode::Manual => Some(DrainQueue::new()?),
            Mode::Threaded => None,
        };
        Ok(CallbackService {
            handlers: Mutex::new(HashMap::new()),
            next_ref: AtomicU64::new(1),
            mode,
            queue,
            executor_tx: Mutex::new(None),
            listener: tokio::sync::Mutex::new(false),
        })
    }

    pub(crate) fn add_handler(&self, handler: HandlerFn) -> u64 {
        let cb_ref = self.next_ref.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .lock()
            .unwrap()
            .insert(cb_ref, Arc::new(handler));
        cb_ref
    }

    pub(crate) fn remove_handler(&self, cb_ref: u64) {
        self.handlers.lock().unwrap().remove(&cb_ref);
    }

    /// Allocate a ref without a handler (proxies, socket bindings).
    pub(crate) fn next_ref(&self) -> u64 {
        self.next_ref.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn callback_fd(&self) -> Option<RawFd> {
        self.queue.as_ref().map(|q| q.fd)
    }

    /// Execute exactly one queued invocation (manual mode).
    pub(crate) fn process_one(&self) -> bool {
        let Some(queue) = &self.queue else {
            return false;
        };
        let Some(job) = queue.pop() else {
            return false;
        };
        let response = self.run(job.id, &job.action);
        let _ = job.done.send(response);
        true
    }

    fn run(&self, id: u64, action: &request::Action) -> Response {
        let cb_ref = match action {
            request::Action::Watch(r) => r.r#ref,
            request::Action::WatchTree(r) => r.r#ref,
            request::Action::Validate(r) => r.r#ref,
            request::Action::Refresh(r) => r.r#ref,
            request::Action::Provide(r) => r.r#ref,
            request::Action::Index(r) => r.r#ref,
            _ => return Response::error(id, code::EINVAL),
        };
        let handler = match self.handlers.lock().unwrap().get(&cb_ref) {
            Some(handler) => handler.clone(),
            None => {
                log::debug!("invocation for unknown callback ref {cb_ref}");
                return Response::error(id, code::EINVAL);
            }
        };
        match (handler.as_ref(), action) {
            (HandlerFn::Watch(f), request::Action::Watch(w)) => {
                f(&w.path, w.value.as_ref());
                Response::ok(id)
            }
            (HandlerFn::WatchTree(f), request::Action::WatchTree(w)) => {
                if let Some(root) = &w.root {
                    f(root);
                }
                Response::ok(id)
            }
            (HandlerFn::Validate(f), request::Action::Validate(v)) => Response {
                id,
                status: f(&v.path, v.value.as_ref()),
                body: None,
            },
            (HandlerFn::Refresh(f), request::Action::Refresh(r)) => {
                Response::with_body(id, response::Body::Validity(f(&r.path)))
            }
            (HandlerFn::Provide(f), request::Action::Provide(p)) => match f(&p.path) {
                Some(value) => Response::with_body(id, response::Body::Value(value)),
                None => Response::ok(id),
            },
            (HandlerFn::Index(f), request::Action::Index(i)) => {
                Response::with_body(id, response::Body::Paths(PathList { paths: f(&i.path) }))
            }
            _ => Response::error(id, code::EINVAL),
        }
    }

    /// Bind the callback listener and start the delivery machinery. Safe to
    /// call on every registration; only the first does anything.
    pub(crate) async fn ensure_listener(self: Arc<Self>) -> Result<(), AptError> {
        let mut started = self.listener.lock().await;
        if *started {
            return Ok(());
        }

        let socket = uri::client_uri(std::process::id());
        let apteryx_common::uri::Endpoint::Unix(path) = socket.parse()? else {
            return Err(AptError::Invalid);
        };
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path)?;
        log::debug!("callback listener on {}", path.display());

        if matches!(self.mode, Mode::Threaded) {
            let (tx, rx) = mpsc::channel::<Job>();
            *self.executor_tx.lock().unwrap() = Some(tx);
            let service = self.clone();
            std::thread::Builder::new()
                .name("apteryx-cb".into())
                .spawn(move || {
                    for job in rx {
                        let response = service.run(job.id, &job.action);
                        let _ = job.done.send(response);
                    }
                })
                .map_err(|e| AptError::Connection(e.to_string()))?;
        }

        let service = self.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let service = service.clone();
                        tokio::spawn(async move {
                            let _ = service.serve_connection(stream).await;
                        });
                    }
                    Err(e) => {
                        log::warn!("callback accept failed: {e}");
                        break;
                    }
                }
            }
        });

        *started = true;
        Ok(())
    }

    async fn serve_connection(
        self: Arc<Self>,
        mut stream: tokio::net::UnixStream,
    ) -> std::io::Result<()> {
        let mut read_buf = BytesMut::new();
        let mut write_buf = BytesMut::new();
        loop {
            let request: Request = read_frame(&mut stream, &mut read_buf).await?;
            let id = request.id;
            let response = match request.action {
                Some(action) => self.dispatch(id, action).await,
                None => Response::error(id, code::EINVAL),
            };
            write_frame(&mut stream, &response, &mut write_buf).await?;
        }
    }

    async fn dispatch(&self, id: u64, action: request::Action) -> Response {
        let (done, wait) = tokio::sync::oneshot::channel();
        let job = Job { id, action, done };
        match self.mode {
            Mode::Threaded => {
                let tx = self.executor_tx.lock().unwrap().clone();
                match tx {
                    Some(tx) if tx.send(job).is_ok() => {}
                    _ => return Response::error(id, code::ETIMEDOUT),
                }
            }
            Mode::Manual => match &self.queue {
                Some(queue) => queue.push(job),
                None => return Response::error(id, code::ETIMEDOUT),
            },
        }
        wait.await
            .unwrap_or_else(|_| Response::error(id, code::ETIMEDOUT))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn watch_action(cb_ref: u64, path: &str) -> request::Action {
        request::Action::Watch(apteryx_common::wire::WatchRequest {
            r#ref: cb_ref,
            path: path.into(),
            value: Some(Bytes::from("v")),
        })
    }

    #[tokio::test]
    async fn manual_queue_executes_in_arrival_order() {
        let service = Arc::new(CallbackService::new(Mode::Manual).unwrap());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let cb_ref = service.add_handler(HandlerFn::Watch(Box::new(move |path, _| {
            sink.lock().unwrap().push(path.to_string());
        })));

        let mut waiters = Vec::new();
        for i in 0..3 {
            let (done, wait) = tokio::sync::oneshot::channel();
            service.queue.as_ref().unwrap().push(Job {
                id: i,
                action: watch_action(cb_ref, &format!("/n/{i}")),
                done,
            });
            waiters.push(wait);
        }

        assert!(service.process_one());
        assert!(service.process_one());
        assert!(service.process_one());
        assert!(!service.process_one());
        assert_eq!(seen.lock().unwrap().clone(), vec!["/n/0", "/n/1", "/n/2"]);
        for wait in waiters {
            assert_eq!(wait.await.unwrap().status, 0);
        }
    }

    #[tokio::test]
    async fn unknown_ref_is_an_error() {
        let service = Arc::new(CallbackService::new(Mode::Threaded).unwrap());
        let response = service.run(9, &watch_action(12345, "/x"));
        assert_eq!(response.status, code::EINVAL);
    }

    #[tokio::test]
    async fn validate_status_passes_through() {
        let service = Arc::new(CallbackService::new(Mode::Threaded).unwrap());
        let cb_ref = service.add_handler(HandlerFn::Validate(Box::new(|_, value| {
            if value.is_some() { 0 } else { code::EPERM }
        })));
        let refuse = request::Action::Validate(apteryx_common::wire::ValidateRequest {
            r#ref: cb_ref,
            path: "/x".into(),
            value: None,
        });
        assert_eq!(service.run(1, &refuse).status, code::EPERM);
    }
}
