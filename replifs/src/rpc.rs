//! Client-facing RPC server.
//!
//! Frames are `[u32 big-endian length][bincode payload]`, capped at
//! [`MAX_MESSAGE_SIZE`]. Each connection is served by its own task and
//! handles one request at a time in strict request/response order.
//! Mutations go through the admission path, reads are served locally.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::{timeout, Duration};

use crate::command::{self, Command, CommandType, Response, MAX_MESSAGE_SIZE};
use crate::error::FsError;
use crate::metrics;
use crate::state_fs::FsHandle;

const RECV_TIMEOUT: Duration = Duration::from_secs(30);

pub struct RpcServer {
    addr: String,
    handle: FsHandle,
    running: Arc<AtomicBool>,
    active: Arc<AtomicUsize>,
    shutdown: watch::Sender<bool>,
    accept_task: Option<tokio::task::JoinHandle<()>>,
}

impl RpcServer {
    pub fn new(addr: String, handle: FsHandle) -> RpcServer {
        let (shutdown, _) = watch::channel(false);
        RpcServer {
            addr,
            handle,
            running: Arc::new(AtomicBool::new(false)),
            active: Arc::new(AtomicUsize::new(0)),
            shutdown,
            accept_task: None,
        }
    }

    pub async fn start(&mut self) -> Result<(), FsError> {
        let listener = TcpListener::bind(&self.addr).await?;
        log::info!("rpc server listening on {}", self.addr);
        self.running.store(true, Ordering::Release);

        let handle = self.handle.clone();
        let running = self.running.clone();
        let active = self.active.clone();
        let mut stop_rx = self.shutdown.subscribe();
        let conn_stop_seed = self.shutdown.subscribe();

        self.accept_task = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            log::info!("rpc connection from {peer}");
                            let _ = stream.set_nodelay(true);
                            let handle = handle.clone();
                            let active = active.clone();
                            let conn_stop = conn_stop_seed.clone();
                            active.fetch_add(1, Ordering::AcqRel);
                            tokio::spawn(async move {
                                serve_connection(stream, handle, conn_stop).await;
                                active.fetch_sub(1, Ordering::AcqRel);
                                log::info!("rpc connection from {peer} closed");
                            });
                        }
                        Err(e) => log::error!("accept failed: {e}"),
                    },
                    _ = stop_rx.changed() => break,
                }
            }
            running.store(false, Ordering::Release);
        }));
        Ok(())
    }

    /// Stops accepting, signals every live connection and joins the accept
    /// loop.
    pub async fn stop(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.accept_task.take() {
            let _ = task.await;
        }
        self.running.store(false, Ordering::Release);
        log::info!("rpc server stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }
}

async fn serve_connection(mut stream: TcpStream, handle: FsHandle, mut stop: watch::Receiver<bool>) {
    loop {
        let frame = tokio::select! {
            frame = timeout(RECV_TIMEOUT, read_frame(&mut stream)) => match frame {
                Ok(frame) => frame,
                Err(_) => {
                    log::debug!("connection idle past receive timeout");
                    break;
                }
            },
            _ = stop.changed() => break,
        };
        let payload = match frame {
            Ok(Some(payload)) => payload,
            Ok(None) => break,
            Err(e) => {
                log::debug!("closing connection: {e}");
                break;
            }
        };

        let response = match command::decode_wire::<Command>(&payload) {
            Ok(cmd) => dispatch(&handle, cmd).await,
            Err(e) => Response::fail(&e),
        };
        let bytes = match command::encode_wire(&response) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!("failed to encode response: {e}");
                break;
            }
        };
        if let Err(e) = write_frame(&mut stream, &bytes).await {
            log::debug!("closing connection on write failure: {e}");
            break;
        }
    }
}

async fn read_frame(stream: &mut TcpStream) -> Result<Option<Vec<u8>>, FsError> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(FsError::Io(e)),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 || len > MAX_MESSAGE_SIZE {
        return Err(FsError::Network(format!("invalid frame length {len}")));
    }
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

async fn write_frame(stream: &mut TcpStream, payload: &[u8]) -> Result<(), FsError> {
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    stream.write_all(&frame).await?;
    Ok(())
}

async fn dispatch(handle: &FsHandle, cmd: Command) -> Response {
    metrics::REQ_COUNTER_VEC
        .with_label_values(&[cmd.op.name()])
        .inc();
    log::debug!("request {:?} path={}", cmd.op, cmd.path);

    let Command {
        op,
        path,
        new_path,
        payload,
    } = cmd;
    let result = match op {
        CommandType::CreateFile => handle.create_file(&path).await.map(|()| Response::ok()),
        CommandType::WriteFile => handle
            .write_file(&path, payload)
            .await
            .map(|()| Response::ok()),
        CommandType::AppendFile => handle
            .append_file(&path, payload)
            .await
            .map(|()| Response::ok()),
        CommandType::DeleteFile => handle.delete_file(&path).await.map(|()| Response::ok()),
        CommandType::CreateDir => handle
            .create_directory(&path)
            .await
            .map(|()| Response::ok()),
        CommandType::DeleteDir => handle
            .delete_directory(&path)
            .await
            .map(|()| Response::ok()),
        CommandType::Rename => handle
            .rename(&path, &new_path)
            .await
            .map(|()| Response::ok()),
        CommandType::ReadFile => handle.read_file(&path).map(Response::with_data),
        CommandType::ListDir => handle.list_directory(&path).map(Response::with_entries),
    };
    match result {
        Ok(response) => response,
        Err(e) => Response::fail(&e),
    }
}
