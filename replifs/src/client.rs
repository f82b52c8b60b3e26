//! Connection-oriented client for the replifs RPC protocol.
//!
//! A single connection is established lazily on the first call and reused.
//! Any transport failure discards it so the next call reconnects.
//! Application-level failures (NotLeader, NotFound, ...) come back inside
//! the [`Response`] untouched; a client talking to a follower is expected
//! to redial the leader named in the error.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};

use crate::command::{self, Command, CommandType, Response, MAX_MESSAGE_SIZE};
use crate::error::FsError;

const CALL_TIMEOUT: Duration = Duration::from_secs(30);

pub struct FsClient {
    addr: String,
    stream: Option<TcpStream>,
}

impl FsClient {
    pub fn new(addr: impl Into<String>) -> FsClient {
        FsClient {
            addr: addr.into(),
            stream: None,
        }
    }

    pub async fn create_file(&mut self, path: &str) -> Result<Response, FsError> {
        self.execute(Command::new(CommandType::CreateFile, path)).await
    }

    pub async fn write_file(
        &mut self,
        path: &str,
        data: impl Into<Vec<u8>>,
    ) -> Result<Response, FsError> {
        self.execute(Command::with_payload(
            CommandType::WriteFile,
            path,
            data.into(),
        ))
        .await
    }

    pub async fn append_file(
        &mut self,
        path: &str,
        data: impl Into<Vec<u8>>,
    ) -> Result<Response, FsError> {
        self.execute(Command::with_payload(
            CommandType::AppendFile,
            path,
            data.into(),
        ))
        .await
    }

    pub async fn delete_file(&mut self, path: &str) -> Result<Response, FsError> {
        self.execute(Command::new(CommandType::DeleteFile, path)).await
    }

    pub async fn create_directory(&mut self, path: &str) -> Result<Response, FsError> {
        self.execute(Command::new(CommandType::CreateDir, path)).await
    }

    pub async fn delete_directory(&mut self, path: &str) -> Result<Response, FsError> {
        self.execute(Command::new(CommandType::DeleteDir, path)).await
    }

    pub async fn rename(&mut self, old_path: &str, new_path: &str) -> Result<Response, FsError> {
        self.execute(Command::rename(old_path, new_path)).await
    }

    pub async fn read_file(&mut self, path: &str) -> Result<Response, FsError> {
        self.execute(Command::new(CommandType::ReadFile, path)).await
    }

    pub async fn list_directory(&mut self, path: &str) -> Result<Response, FsError> {
        self.execute(Command::new(CommandType::ListDir, path)).await
    }

    /// Sends one command and waits for its response.
    pub async fn execute(&mut self, cmd: Command) -> Result<Response, FsError> {
        match self.round_trip(&cmd).await {
            Ok(response) => Ok(response),
            Err(e) => {
                self.stream = None;
                Err(e)
            }
        }
    }

    async fn round_trip(&mut self, cmd: &Command) -> Result<Response, FsError> {
        let payload = command::encode_wire(cmd)?;
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(FsError::TooLarge(format!(
                "request of {} bytes",
                payload.len()
            )));
        }

        let addr = self.addr.clone();
        if self.stream.is_none() {
            let stream = timeout(CALL_TIMEOUT, TcpStream::connect(&addr))
                .await
                .map_err(|_| FsError::Timeout(format!("connect to {addr}")))?
                .map_err(|e| FsError::Network(format!("connect to {addr}: {e}")))?;
            stream.set_nodelay(true)?;
            self.stream = Some(stream);
        }
        let stream = self.stream.as_mut().expect("connected above");

        let mut frame = Vec::with_capacity(4 + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&payload);
        timeout(CALL_TIMEOUT, stream.write_all(&frame))
            .await
            .map_err(|_| FsError::Timeout("send".to_string()))?
            .map_err(|e| FsError::Network(format!("send: {e}")))?;

        let mut len_buf = [0u8; 4];
        timeout(CALL_TIMEOUT, stream.read_exact(&mut len_buf))
            .await
            .map_err(|_| FsError::Timeout("receive".to_string()))?
            .map_err(|e| FsError::Network(format!("receive: {e}")))?;
        let len = u32::from_be_bytes(len_buf) as usize;
        if len == 0 || len > MAX_MESSAGE_SIZE {
            return Err(FsError::Network(format!("invalid frame length {len}")));
        }
        let mut buf = vec![0u8; len];
        timeout(CALL_TIMEOUT, stream.read_exact(&mut buf))
            .await
            .map_err(|_| FsError::Timeout("receive".to_string()))?
            .map_err(|e| FsError::Network(format!("receive: {e}")))?;

        command::decode_wire(&buf)
    }
}
