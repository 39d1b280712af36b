//! IPC protocol between the engine and `scriptpad-host` processes.
//!
//! Uses length-prefixed rkyv messages over the child's stdin/stdout.
//! Format: 4-byte length (u32 LE) + rkyv-encoded message.

use std::io::{ErrorKind, Read, Write};

use rkyv::{Archive, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::execute::RunResult;
use crate::output::{OutputChannel, OutputPayload};

/// Messages larger than this are rejected.
pub const MAX_MESSAGE_LEN: usize = 100 * 1024 * 1024;

/// Everything the host needs to run one module.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct RunRequest {
    pub run_id: String,
    pub script_id: String,
    pub script_name: String,
    pub script_path: Option<String>,
    pub is_dirty: bool,
    /// Module file written by the engine for this run.
    pub module_path: String,
    pub module_name: String,
    /// Directories whose dylibs are loaded ahead of the module.
    pub probing_paths: Vec<String>,
    /// 1-based line the user's code starts on.
    pub user_start_line: Option<u64>,
}

/// Command sent from the engine to a host process.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub enum HostCommand {
    /// Load and run a module. At most one run is active at a time.
    RunScript(RunRequest),

    /// Ask the active run to stop.
    Cancel { run_id: String },

    /// Answer the active run's pending `InputRequested`.
    ProvideInput { run_id: String, line: String },

    /// Exit once the active run, if any, is abandoned.
    Shutdown,

    /// Liveness check.
    Ping,
}

/// Message sent from a host process to the engine.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub enum HostMessage {
    /// Sent once at startup.
    Ready { pid: u32 },

    /// Output produced by the active run.
    Output {
        run_id: String,
        channel: OutputChannel,
        payload: OutputPayload,
    },

    /// The active run is blocked reading a line of user input.
    InputRequested { run_id: String, prompt: String },

    /// Exactly one per `RunScript`.
    RunComplete {
        run_id: String,
        result: RunResult,
        restart_host_on_next_run: bool,
    },

    /// Response to `Ping`.
    Pong,
}

fn encode(
    message: &impl for<'a> Serialize<
        rkyv::rancor::Strategy<
            rkyv::ser::Serializer<
                rkyv::util::AlignedVec,
                rkyv::ser::allocator::ArenaHandle<'a>,
                rkyv::ser::sharing::Share,
            >,
            rkyv::rancor::Error,
        >,
    >,
) -> Result<rkyv::util::AlignedVec> {
    let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(message)
        .map_err(|e| Error::Serialization(format!("Failed to encode IPC message: {}", e)))?;
    if bytes.len() > MAX_MESSAGE_LEN {
        return Err(Error::Ipc(format!("IPC message too large: {} bytes", bytes.len())));
    }
    Ok(bytes)
}

fn decode<T>(bytes: &[u8]) -> Result<T>
where
    T: Archive,
    T::Archived: Deserialize<T, rkyv::rancor::Strategy<rkyv::de::Pool, rkyv::rancor::Error>>,
{
    // The body arrives unaligned; archived data must sit on an aligned buffer.
    let mut aligned = rkyv::util::AlignedVec::<16>::with_capacity(bytes.len());
    aligned.extend_from_slice(bytes);

    // SAFETY: only our own processes write to these pipes.
    unsafe { rkyv::from_bytes_unchecked::<T, rkyv::rancor::Error>(&aligned) }
        .map_err(|e| Error::Serialization(format!("Failed to decode IPC message: {}", e)))
}

fn check_len(len_bytes: [u8; 4]) -> Result<usize> {
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_MESSAGE_LEN {
        return Err(Error::Ipc(format!("IPC message too large: {} bytes", len)));
    }
    Ok(len)
}

/// Write a message using length-prefixed rkyv encoding.
pub fn write_message<W: Write>(
    writer: &mut W,
    message: &impl for<'a> Serialize<
        rkyv::rancor::Strategy<
            rkyv::ser::Serializer<
                rkyv::util::AlignedVec,
                rkyv::ser::allocator::ArenaHandle<'a>,
                rkyv::ser::sharing::Share,
            >,
            rkyv::rancor::Error,
        >,
    >,
) -> Result<()> {
    let bytes = encode(message)?;
    let len = bytes.len() as u32;
    writer
        .write_all(&len.to_le_bytes())
        .map_err(|e| Error::Ipc(format!("Failed to write IPC message length: {}", e)))?;
    writer
        .write_all(&bytes)
        .map_err(|e| Error::Ipc(format!("Failed to write IPC message body: {}", e)))?;
    writer
        .flush()
        .map_err(|e| Error::Ipc(format!("Failed to flush IPC stream: {}", e)))?;
    Ok(())
}

/// Read a message. `Ok(None)` on a clean end of stream.
pub fn read_message<R: Read, T>(reader: &mut R) -> Result<Option<T>>
where
    T: Archive,
    T::Archived: Deserialize<T, rkyv::rancor::Strategy<rkyv::de::Pool, rkyv::rancor::Error>>,
{
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(Error::Ipc(format!("Failed to read IPC message length: {}", e))),
    }
    let len = check_len(len_bytes)?;

    let mut bytes = vec![0u8; len];
    reader
        .read_exact(&mut bytes)
        .map_err(|e| Error::Ipc(format!("Failed to read IPC message body: {}", e)))?;
    decode(&bytes).map(Some)
}

/// Async [`write_message`].
pub async fn write_message_async<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &impl for<'a> Serialize<
        rkyv::rancor::Strategy<
            rkyv::ser::Serializer<
                rkyv::util::AlignedVec,
                rkyv::ser::allocator::ArenaHandle<'a>,
                rkyv::ser::sharing::Share,
            >,
            rkyv::rancor::Error,
        >,
    >,
) -> Result<()> {
    let bytes = encode(message)?;
    let len = bytes.len() as u32;
    writer
        .write_all(&len.to_le_bytes())
        .await
        .map_err(|e| Error::Ipc(format!("Failed to write IPC message length: {}", e)))?;
    writer
        .write_all(&bytes)
        .await
        .map_err(|e| Error::Ipc(format!("Failed to write IPC message body: {}", e)))?;
    writer
        .flush()
        .await
        .map_err(|e| Error::Ipc(format!("Failed to flush IPC stream: {}", e)))?;
    Ok(())
}

/// Async [`read_message`].
///
/// Not cancel-safe: run it on a dedicated task that owns the reader.
pub async fn read_message_async<R: AsyncRead + Unpin, T>(reader: &mut R) -> Result<Option<T>>
where
    T: Archive,
    T::Archived: Deserialize<T, rkyv::rancor::Strategy<rkyv::de::Pool, rkyv::rancor::Error>>,
{
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(Error::Ipc(format!("Failed to read IPC message length: {}", e))),
    }
    let len = check_len(len_bytes)?;

    let mut bytes = vec![0u8; len];
    reader
        .read_exact(&mut bytes)
        .await
        .map_err(|e| Error::Ipc(format!("Failed to read IPC message body: {}", e)))?;
    decode(&bytes).map(Some)
}
