//! TCP transport with filesystem rendezvous.
//!
//! The acceptor binds an ephemeral port on localhost and publishes
//! `host:port` in a dot-file inside the exchange directory; requesters poll
//! for that file. Frames are `[kind u8][count u64 LE][payload]` with
//! little-endian doubles; the transport assumes both peers share byte order.
//!
//! Every connection owns a background writer thread, which is what makes
//! asynchronous sends genuinely non-blocking even when the kernel socket
//! buffer is full.

use std::fs;
use std::io::{BufReader, BufWriter, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use tracing::trace;

use crate::com::{
  ensure_connected, Communication, CommunicationFactory, PendingRequests, SendTicket,
};
use crate::error::{CoupleError, Result};
use crate::ids::Rank;

const KIND_F64S: u8 = 0;
const KIND_F64: u8 = 1;
const KIND_USIZES: u8 = 2;
const KIND_USIZE: u8 = 3;
const KIND_BOOL: u8 = 4;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_millis(5);

fn io_err(context: &str, err: std::io::Error) -> CoupleError {
  CoupleError::Transport(format!("{context}: {err}"))
}

/// Work item for a connection's writer thread.
struct WriteJob {
  frame: Vec<u8>,
  done: Option<Sender<Result<()>>>,
}

/// One live TCP link to a single remote rank.
struct Conn {
  reader: Mutex<BufReader<TcpStream>>,
  writer_tx: Option<Sender<WriteJob>>,
  writer: Option<JoinHandle<()>>,
}

impl Conn {
  fn new(stream: TcpStream) -> Result<Self> {
    stream.set_nodelay(true).map_err(|e| io_err("set_nodelay", e))?;
    let read_half = stream.try_clone().map_err(|e| io_err("clone stream", e))?;
    let (writer_tx, writer_rx): (Sender<WriteJob>, Receiver<WriteJob>) = unbounded();
    let writer = thread::spawn(move || {
      let mut out = BufWriter::new(stream);
      for job in writer_rx.iter() {
        let outcome = out
          .write_all(&job.frame)
          .and_then(|_| out.flush())
          .map_err(|e| io_err("socket write", e));
        if let Some(done) = job.done {
          let _ = done.send(outcome);
        }
      }
    });
    Ok(Self {
      reader: Mutex::new(BufReader::new(read_half)),
      writer_tx: Some(writer_tx),
      writer: Some(writer),
    })
  }

  fn enqueue(&self, frame: Vec<u8>, done: Option<Sender<Result<()>>>) -> Result<()> {
    let tx = self
      .writer_tx
      .as_ref()
      .ok_or_else(|| CoupleError::Transport("writer already shut down".into()))?;
    tx.send(WriteJob { frame, done })
      .map_err(|_| CoupleError::Transport("writer thread terminated".into()))
  }

  fn shutdown(&mut self) {
    self.writer_tx.take();
    if let Some(handle) = self.writer.take() {
      let _ = handle.join();
    }
  }
}

fn frame(kind: u8, payload: &[u8], count: usize) -> Vec<u8> {
  let mut out = Vec::with_capacity(9 + payload.len());
  out.push(kind);
  out.extend_from_slice(&(count as u64).to_le_bytes());
  out.extend_from_slice(payload);
  out
}

fn f64s_frame(items: &[f64]) -> Vec<u8> {
  let mut payload = Vec::with_capacity(items.len() * 8);
  for v in items {
    payload.extend_from_slice(&v.to_le_bytes());
  }
  frame(KIND_F64S, &payload, items.len())
}

/// Socket-backed [`Communication`] endpoint.
pub struct SocketCommunication {
  exchange_dir: PathBuf,
  conns: Vec<Conn>,
  address_file: Option<PathBuf>,
  connected: bool,
  connect_timeout: Duration,
  pending: PendingRequests,
}

impl SocketCommunication {
  /// `exchange_dir` must be reachable by both participants; it carries the
  /// published acceptor addresses.
  pub fn new(exchange_dir: impl Into<PathBuf>) -> Self {
    Self {
      exchange_dir: exchange_dir.into(),
      conns: Vec::new(),
      address_file: None,
      connected: false,
      connect_timeout: CONNECT_TIMEOUT,
      pending: PendingRequests::new(),
    }
  }

  /// Override how long a requester polls for the acceptor address.
  pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
    self.connect_timeout = timeout;
    self
  }

  fn address_path(&self, acceptor: &str, requester: &str) -> PathBuf {
    self.exchange_dir.join(format!(".{acceptor}-{requester}.address"))
  }

  fn conn(&self, rank: Rank) -> Result<&Conn> {
    ensure_connected(self.connected, "socket endpoint")?;
    self.conns.get(rank).ok_or_else(|| {
      CoupleError::Transport(format!(
        "remote rank {rank} out of range (remote size {})",
        self.conns.len()
      ))
    })
  }

  fn read_frame(&self, from: Rank, wanted_kind: u8, wanted: &str) -> Result<(usize, Vec<u8>)> {
    let conn = self.conn(from)?;
    let mut reader = conn.reader.lock().expect("socket reader poisoned");
    let mut head = [0u8; 9];
    reader.read_exact(&mut head).map_err(|e| io_err("socket read", e))?;
    let kind = head[0];
    let count = u64::from_le_bytes(head[1..9].try_into().expect("8 bytes")) as usize;
    let per_item = match kind {
      KIND_F64S | KIND_F64 | KIND_USIZES | KIND_USIZE => 8,
      KIND_BOOL => 1,
      other => {
        return Err(CoupleError::Transport(format!("unknown frame kind {other}")));
      }
    };
    let mut payload = vec![0u8; count * per_item];
    reader.read_exact(&mut payload).map_err(|e| io_err("socket read", e))?;
    if kind != wanted_kind {
      return Err(CoupleError::Transport(format!("expected {wanted}, received kind {kind}")));
    }
    Ok((count, payload))
  }
}

impl Communication for SocketCommunication {
  fn is_connected(&self) -> bool {
    self.connected
  }

  fn remote_size(&self) -> usize {
    self.conns.len()
  }

  fn accept_connection(&mut self, acceptor: &str, requester: &str) -> Result<()> {
    if self.connected {
      return Err(CoupleError::AlreadyConnected(format!("{acceptor}<-{requester}")));
    }
    let path = self.address_path(acceptor, requester);
    if path.exists() {
      return Err(CoupleError::AlreadyConnected(path.display().to_string()));
    }
    fs::create_dir_all(&self.exchange_dir)?;
    let listener =
      TcpListener::bind(("127.0.0.1", 0)).map_err(|e| io_err("bind listener", e))?;
    let addr = listener.local_addr().map_err(|e| io_err("local addr", e))?;
    fs::write(&path, addr.to_string())?;
    trace!(address = %addr, file = %path.display(), "published acceptor address");

    // The first requester announces the group size in its header.
    let mut pending: Vec<Option<Conn>> = Vec::new();
    let mut expected = usize::MAX;
    let mut seen = 0usize;
    while seen < expected {
      let (stream, _) = listener.accept().map_err(|e| io_err("accept", e))?;
      let mut head = [0u8; 16];
      (&stream).read_exact(&mut head).map_err(|e| io_err("handshake", e))?;
      let rank = u64::from_le_bytes(head[0..8].try_into().expect("8 bytes")) as usize;
      let size = u64::from_le_bytes(head[8..16].try_into().expect("8 bytes")) as usize;
      if expected == usize::MAX {
        expected = size;
        pending = (0..size).map(|_| None).collect();
      }
      if size != expected || rank >= expected {
        return Err(CoupleError::Transport(format!(
          "inconsistent requester group: rank {rank} of {size}"
        )));
      }
      if pending[rank].is_some() {
        return Err(CoupleError::AlreadyConnected(format!("socket rank {rank}")));
      }
      pending[rank] = Some(Conn::new(stream)?);
      seen += 1;
    }

    self.conns = pending.into_iter().map(|c| c.expect("all ranks arrived")).collect();
    self.address_file = Some(path);
    self.connected = true;
    Ok(())
  }

  fn request_connection(
    &mut self,
    acceptor: &str,
    requester: &str,
    own_rank: Rank,
    own_size: usize,
  ) -> Result<()> {
    if self.connected {
      return Err(CoupleError::AlreadyConnected(format!("{acceptor}<-{requester}")));
    }
    let path = self.address_path(acceptor, requester);
    let deadline = Instant::now() + self.connect_timeout;
    let address = loop {
      match fs::read_to_string(&path) {
        Ok(text) if !text.is_empty() => break text,
        _ if Instant::now() > deadline => {
          return Err(CoupleError::NotConnected(format!(
            "acceptor address never appeared at {}",
            path.display()
          )));
        }
        _ => thread::sleep(POLL_INTERVAL),
      }
    };
    let stream =
      TcpStream::connect(address.trim()).map_err(|e| io_err("connect", e))?;
    let mut head = Vec::with_capacity(16);
    head.extend_from_slice(&(own_rank as u64).to_le_bytes());
    head.extend_from_slice(&(own_size as u64).to_le_bytes());
    (&stream).write_all(&head).map_err(|e| io_err("handshake", e))?;
    self.conns = vec![Conn::new(stream)?];
    self.connected = true;
    Ok(())
  }

  fn close_connection(&mut self) -> Result<()> {
    ensure_connected(self.connected, "socket endpoint")?;
    self.pending.check_drained()?;
    for conn in &mut self.conns {
      conn.shutdown();
    }
    self.conns.clear();
    if let Some(path) = self.address_file.take() {
      let _ = fs::remove_file(path);
    }
    self.connected = false;
    Ok(())
  }

  fn send_f64s(&self, items: &[f64], to: Rank) -> Result<()> {
    self.conn(to)?.enqueue(f64s_frame(items), None)
  }

  fn send_f64(&self, item: f64, to: Rank) -> Result<()> {
    self.conn(to)?.enqueue(frame(KIND_F64, &item.to_le_bytes(), 1), None)
  }

  fn send_usizes(&self, items: &[usize], to: Rank) -> Result<()> {
    let mut payload = Vec::with_capacity(items.len() * 8);
    for v in items {
      payload.extend_from_slice(&(*v as u64).to_le_bytes());
    }
    self.conn(to)?.enqueue(frame(KIND_USIZES, &payload, items.len()), None)
  }

  fn send_usize(&self, item: usize, to: Rank) -> Result<()> {
    self.conn(to)?.enqueue(frame(KIND_USIZE, &(item as u64).to_le_bytes(), 1), None)
  }

  fn send_bool(&self, item: bool, to: Rank) -> Result<()> {
    self.conn(to)?.enqueue(frame(KIND_BOOL, &[item as u8], 1), None)
  }

  fn recv_f64s(&self, len: usize, from: Rank) -> Result<Vec<f64>> {
    let (count, payload) = self.read_frame(from, KIND_F64S, "f64 array")?;
    if count != len {
      return Err(CoupleError::SizeMismatch { expected: len, got: count });
    }
    Ok(
      payload
        .chunks_exact(8)
        .map(|c| f64::from_le_bytes(c.try_into().expect("8 bytes")))
        .collect(),
    )
  }

  fn recv_f64(&self, from: Rank) -> Result<f64> {
    let (_, payload) = self.read_frame(from, KIND_F64, "f64")?;
    Ok(f64::from_le_bytes(payload[0..8].try_into().expect("8 bytes")))
  }

  fn recv_usizes(&self, len: usize, from: Rank) -> Result<Vec<usize>> {
    let (count, payload) = self.read_frame(from, KIND_USIZES, "usize array")?;
    if count != len {
      return Err(CoupleError::SizeMismatch { expected: len, got: count });
    }
    Ok(
      payload
        .chunks_exact(8)
        .map(|c| u64::from_le_bytes(c.try_into().expect("8 bytes")) as usize)
        .collect(),
    )
  }

  fn recv_usize(&self, from: Rank) -> Result<usize> {
    let (_, payload) = self.read_frame(from, KIND_USIZE, "usize")?;
    Ok(u64::from_le_bytes(payload[0..8].try_into().expect("8 bytes")) as usize)
  }

  fn recv_bool(&self, from: Rank) -> Result<bool> {
    let (_, payload) = self.read_frame(from, KIND_BOOL, "bool")?;
    Ok(payload[0] != 0)
  }

  fn start_send_f64s(&self, items: &[f64], to: Rank) -> Result<SendTicket> {
    let (done_tx, done_rx) = bounded(1);
    self.conn(to)?.enqueue(f64s_frame(items), Some(done_tx))?;
    Ok(SendTicket::Deferred(done_rx))
  }

  fn pending(&self) -> &PendingRequests {
    &self.pending
  }
}

impl Drop for SocketCommunication {
  fn drop(&mut self) {
    for conn in &mut self.conns {
      conn.shutdown();
    }
  }
}

/// Factory producing socket endpoints that share one exchange directory.
pub struct SocketCommunicationFactory {
  exchange_dir: PathBuf,
}

impl SocketCommunicationFactory {
  pub fn new(exchange_dir: impl AsRef<Path>) -> Self {
    Self { exchange_dir: exchange_dir.as_ref().to_path_buf() }
  }
}

impl CommunicationFactory for SocketCommunicationFactory {
  fn new_communication(&self) -> Box<dyn Communication> {
    Box::new(SocketCommunication::new(self.exchange_dir.clone()))
  }
}

#[cfg(test)]
#[path = "socket_test.rs"]
mod socket_test;
