//! Filesystem commands, responses and their two codecs.
//!
//! Client and server exchange bincode-encoded [`Command`]/[`Response`]
//! records inside length-prefixed frames. Replicated log entries use a
//! separate fixed layout (`encode_log_entry`/`decode_log_entry`) so the log
//! bytes stay stable independently of the wire serializer.

use serde::{Deserialize, Serialize};

use crate::error::FsError;

/// Largest accepted wire frame payload or replicated log entry.
pub const MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandType {
    CreateFile = 1,
    ReadFile = 2,
    WriteFile = 3,
    AppendFile = 4,
    DeleteFile = 5,
    CreateDir = 6,
    ListDir = 7,
    DeleteDir = 8,
    Rename = 9,
}

impl CommandType {
    /// Mutations travel through the replicated log; the rest are served
    /// from the local replica.
    pub fn is_mutation(self) -> bool {
        !matches!(self, CommandType::ReadFile | CommandType::ListDir)
    }

    pub fn name(self) -> &'static str {
        match self {
            CommandType::CreateFile => "create_file",
            CommandType::ReadFile => "read_file",
            CommandType::WriteFile => "write_file",
            CommandType::AppendFile => "append_file",
            CommandType::DeleteFile => "delete_file",
            CommandType::CreateDir => "create_dir",
            CommandType::ListDir => "list_dir",
            CommandType::DeleteDir => "delete_dir",
            CommandType::Rename => "rename",
        }
    }

    fn from_u8(tag: u8) -> Option<CommandType> {
        match tag {
            1 => Some(CommandType::CreateFile),
            2 => Some(CommandType::ReadFile),
            3 => Some(CommandType::WriteFile),
            4 => Some(CommandType::AppendFile),
            5 => Some(CommandType::DeleteFile),
            6 => Some(CommandType::CreateDir),
            7 => Some(CommandType::ListDir),
            8 => Some(CommandType::DeleteDir),
            9 => Some(CommandType::Rename),
            _ => None,
        }
    }
}

/// One filesystem request. `new_path` is only meaningful for RENAME,
/// `payload` only for WRITE_FILE / APPEND_FILE.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub op: CommandType,
    pub path: String,
    pub new_path: String,
    pub payload: Vec<u8>,
}

impl Command {
    pub fn new(op: CommandType, path: impl Into<String>) -> Command {
        Command {
            op,
            path: path.into(),
            new_path: String::new(),
            payload: Vec::new(),
        }
    }

    pub fn with_payload(op: CommandType, path: impl Into<String>, payload: Vec<u8>) -> Command {
        Command {
            op,
            path: path.into(),
            new_path: String::new(),
            payload,
        }
    }

    pub fn rename(path: impl Into<String>, new_path: impl Into<String>) -> Command {
        Command {
            op: CommandType::Rename,
            path: path.into(),
            new_path: new_path.into(),
            payload: Vec::new(),
        }
    }
}

/// Reply to a [`Command`]. `data` carries read bytes, `entries` carries
/// directory listings; both are empty otherwise.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    pub error: String,
    pub data: Vec<u8>,
    pub entries: Vec<String>,
}

impl Response {
    pub fn ok() -> Response {
        Response {
            ok: true,
            ..Response::default()
        }
    }

    pub fn with_data(data: Vec<u8>) -> Response {
        Response {
            ok: true,
            data,
            ..Response::default()
        }
    }

    pub fn with_entries(entries: Vec<String>) -> Response {
        Response {
            ok: true,
            entries,
            ..Response::default()
        }
    }

    pub fn fail(err: &FsError) -> Response {
        Response {
            ok: false,
            error: err.to_string(),
            ..Response::default()
        }
    }
}

pub fn encode_wire<T: Serialize>(value: &T) -> Result<Vec<u8>, FsError> {
    bincode::serialize(value).map_err(|e| FsError::Serialization(e.to_string()))
}

pub fn decode_wire<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, FsError> {
    bincode::deserialize(bytes).map_err(|e| FsError::Serialization(e.to_string()))
}

/// Log entry layout: `[op:u8]` followed by three length-prefixed slots
/// (path, new_path, payload), each `[len:u32 little-endian][bytes]`.
pub fn encode_log_entry(cmd: &Command) -> Vec<u8> {
    let mut buf = Vec::with_capacity(
        1 + 12 + cmd.path.len() + cmd.new_path.len() + cmd.payload.len(),
    );
    buf.push(cmd.op as u8);
    put_slot(&mut buf, cmd.path.as_bytes());
    put_slot(&mut buf, cmd.new_path.as_bytes());
    put_slot(&mut buf, &cmd.payload);
    buf
}

pub fn decode_log_entry(bytes: &[u8]) -> Result<Command, FsError> {
    if bytes.len() < 13 {
        return Err(FsError::Serialization(format!(
            "log entry too short: {} bytes",
            bytes.len()
        )));
    }
    let op = CommandType::from_u8(bytes[0])
        .ok_or_else(|| FsError::Serialization(format!("unknown command tag {}", bytes[0])))?;
    let mut pos = 1usize;
    let path = take_slot(bytes, &mut pos)?;
    let new_path = take_slot(bytes, &mut pos)?;
    let payload = take_slot(bytes, &mut pos)?;
    if pos != bytes.len() {
        return Err(FsError::Serialization(
            "trailing bytes after log entry".to_string(),
        ));
    }
    Ok(Command {
        op,
        path: into_utf8(path)?,
        new_path: into_utf8(new_path)?,
        payload,
    })
}

fn put_slot(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    buf.extend_from_slice(bytes);
}

fn take_slot(bytes: &[u8], pos: &mut usize) -> Result<Vec<u8>, FsError> {
    if *pos + 4 > bytes.len() {
        return Err(FsError::Serialization(
            "log entry truncated at slot length".to_string(),
        ));
    }
    let len = u32::from_le_bytes(bytes[*pos..*pos + 4].try_into().expect("4 bytes")) as usize;
    *pos += 4;
    if *pos + len > bytes.len() {
        return Err(FsError::Serialization(format!(
            "slot length {len} exceeds entry size"
        )));
    }
    let slot = bytes[*pos..*pos + len].to_vec();
    *pos += len;
    Ok(slot)
}

fn into_utf8(bytes: Vec<u8>) -> Result<String, FsError> {
    String::from_utf8(bytes).map_err(|e| FsError::Serialization(format!("non-utf8 path: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(cmd: Command) {
        let encoded = encode_log_entry(&cmd);
        let decoded = decode_log_entry(&encoded).unwrap();
        assert_eq!(decoded, cmd);
    }

    #[test]
    fn log_codec_round_trips_every_op() {
        round_trip(Command::new(CommandType::CreateFile, "a.txt"));
        round_trip(Command::new(CommandType::CreateDir, "dir"));
        round_trip(Command::new(CommandType::DeleteFile, "a.txt"));
        round_trip(Command::new(CommandType::DeleteDir, "dir"));
        round_trip(Command::with_payload(
            CommandType::WriteFile,
            "a.txt",
            b"hello".to_vec(),
        ));
        round_trip(Command::with_payload(
            CommandType::AppendFile,
            "a.txt",
            vec![0u8, 1, 2, 255],
        ));
        round_trip(Command::rename("old", "new"));
        round_trip(Command::new(CommandType::ReadFile, "a.txt"));
        round_trip(Command::new(CommandType::ListDir, ""));
    }

    #[test]
    fn log_codec_handles_empty_and_non_ascii_slots() {
        round_trip(Command::new(CommandType::CreateFile, ""));
        round_trip(Command::with_payload(CommandType::WriteFile, "k", Vec::new()));
        round_trip(Command::rename("директория/файл", "ディレクトリ/ファイル"));
    }

    #[test]
    fn log_codec_rejects_truncated_entries() {
        let encoded = encode_log_entry(&Command::with_payload(
            CommandType::WriteFile,
            "a.txt",
            b"payload".to_vec(),
        ));
        for cut in [0, 1, 5, encoded.len() - 1] {
            assert!(matches!(
                decode_log_entry(&encoded[..cut]),
                Err(FsError::Serialization(_))
            ));
        }
    }

    #[test]
    fn log_codec_rejects_unknown_tags() {
        let mut encoded = encode_log_entry(&Command::new(CommandType::CreateFile, "a"));
        encoded[0] = 42;
        assert!(matches!(
            decode_log_entry(&encoded),
            Err(FsError::Serialization(_))
        ));
    }

    #[test]
    fn log_codec_rejects_trailing_bytes() {
        let mut encoded = encode_log_entry(&Command::new(CommandType::CreateFile, "a"));
        encoded.push(0);
        assert!(matches!(
            decode_log_entry(&encoded),
            Err(FsError::Serialization(_))
        ));
    }

    #[test]
    fn wire_codec_round_trips_commands_and_responses() {
        let cmd = Command::with_payload(CommandType::AppendFile, "log.txt", b"line\n".to_vec());
        let decoded: Command = decode_wire(&encode_wire(&cmd).unwrap()).unwrap();
        assert_eq!(decoded, cmd);

        let resp = Response::with_entries(vec!["a.txt".to_string(), "b".to_string()]);
        let decoded: Response = decode_wire(&encode_wire(&resp).unwrap()).unwrap();
        assert_eq!(decoded, resp);
    }
}
