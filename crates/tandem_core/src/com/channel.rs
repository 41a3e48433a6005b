//! In-process transport backed by crossbeam channels.
//!
//! Endpoints rendezvous through a shared [`ChannelNetwork`]: the acceptor
//! registers under `"<acceptor><-<requester>"` and blocks until every
//! requester rank has said hello; each requester brings its own pair of
//! unbounded channels and blocks until the acceptor acknowledges it.
//! Messages on one channel arrive in issue order; distinct channels are
//! independent.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::trace;

use crate::com::{
  ensure_connected, Communication, CommunicationFactory, PendingRequests, SendTicket,
};
use crate::error::{CoupleError, Result};
use crate::ids::Rank;

/// Typed payload travelling over an in-process channel.
#[derive(Debug)]
enum Msg {
  F64s(Vec<f64>),
  F64(f64),
  Usizes(Vec<usize>),
  Usize(usize),
  Bool(bool),
}

impl Msg {
  fn kind(&self) -> &'static str {
    match self {
      Msg::F64s(_) => "f64 array",
      Msg::F64(_) => "f64",
      Msg::Usizes(_) => "usize array",
      Msg::Usize(_) => "usize",
      Msg::Bool(_) => "bool",
    }
  }
}

/// One duplex link to a single remote rank.
struct Endpoint {
  tx: Sender<Msg>,
  rx: Receiver<Msg>,
}

/// Introduction sent by a requester to the acceptor of a connection.
struct Hello {
  rank: Rank,
  size: usize,
  /// Acceptor-side sender towards the requester.
  to_requester: Sender<Msg>,
  /// Acceptor-side receiver from the requester.
  from_requester: Receiver<Msg>,
  /// Fired once the acceptor has registered this requester.
  ack: Sender<()>,
}

enum Slot {
  /// Connection is forming; the receiver is taken by the acceptor.
  Waiting { hello_tx: Sender<Hello>, hello_rx: Option<Receiver<Hello>> },
  /// Both sides are through; further setup attempts are duplicates.
  Connected,
}

/// Process-wide rendezvous registry for channel endpoints.
///
/// Cheap to clone; all clones share the same slot table. Create one per
/// coupled run and hand it to every participant thread.
#[derive(Clone, Default)]
pub struct ChannelNetwork {
  slots: Arc<Mutex<HashMap<String, Slot>>>,
}

impl ChannelNetwork {
  pub fn new() -> Self {
    Self::default()
  }

  fn key(acceptor: &str, requester: &str) -> String {
    format!("{acceptor}<-{requester}")
  }

  /// Takes the hello receiver for an acceptor, creating the slot on demand.
  fn acceptor_slot(&self, key: &str) -> Result<Receiver<Hello>> {
    let mut slots = self.slots.lock().expect("channel network poisoned");
    match slots.entry(key.to_string()).or_insert_with(|| {
      let (hello_tx, hello_rx) = unbounded();
      Slot::Waiting { hello_tx, hello_rx: Some(hello_rx) }
    }) {
      Slot::Waiting { hello_rx, .. } => hello_rx
        .take()
        .ok_or_else(|| CoupleError::AlreadyConnected(key.to_string())),
      Slot::Connected => Err(CoupleError::AlreadyConnected(key.to_string())),
    }
  }

  /// Clones the hello sender for a requester, creating the slot on demand.
  fn requester_slot(&self, key: &str) -> Result<Sender<Hello>> {
    let mut slots = self.slots.lock().expect("channel network poisoned");
    match slots.entry(key.to_string()).or_insert_with(|| {
      let (hello_tx, hello_rx) = unbounded();
      Slot::Waiting { hello_tx, hello_rx: Some(hello_rx) }
    }) {
      Slot::Waiting { hello_tx, .. } => Ok(hello_tx.clone()),
      Slot::Connected => Err(CoupleError::AlreadyConnected(key.to_string())),
    }
  }

  fn mark_connected(&self, key: &str) {
    let mut slots = self.slots.lock().expect("channel network poisoned");
    slots.insert(key.to_string(), Slot::Connected);
  }
}

/// Channel-backed [`Communication`] endpoint.
pub struct ChannelCommunication {
  network: ChannelNetwork,
  endpoints: Vec<Endpoint>,
  connected: bool,
  pending: PendingRequests,
}

impl ChannelCommunication {
  pub fn new(network: ChannelNetwork) -> Self {
    Self { network, endpoints: Vec::new(), connected: false, pending: PendingRequests::new() }
  }

  fn endpoint(&self, rank: Rank) -> Result<&Endpoint> {
    ensure_connected(self.connected, "channel endpoint")?;
    self.endpoints.get(rank).ok_or_else(|| {
      CoupleError::Transport(format!(
        "remote rank {rank} out of range (remote size {})",
        self.endpoints.len()
      ))
    })
  }

  fn push(&self, msg: Msg, to: Rank) -> Result<()> {
    self
      .endpoint(to)?
      .tx
      .send(msg)
      .map_err(|_| CoupleError::Transport(format!("remote rank {to} hung up")))
  }

  fn pull(&self, from: Rank) -> Result<Msg> {
    self
      .endpoint(from)?
      .rx
      .recv()
      .map_err(|_| CoupleError::Transport(format!("remote rank {from} hung up")))
  }

  fn unexpected(got: &Msg, wanted: &str) -> CoupleError {
    CoupleError::Transport(format!("expected {wanted}, received {}", got.kind()))
  }
}

impl Communication for ChannelCommunication {
  fn is_connected(&self) -> bool {
    self.connected
  }

  fn remote_size(&self) -> usize {
    self.endpoints.len()
  }

  fn accept_connection(&mut self, acceptor: &str, requester: &str) -> Result<()> {
    if self.connected {
      return Err(CoupleError::AlreadyConnected(format!("{acceptor}<-{requester}")));
    }
    let key = ChannelNetwork::key(acceptor, requester);
    let hello_rx = self.network.acceptor_slot(&key)?;

    // The first hello announces the requester group size; acknowledge each
    // requester as soon as it arrives so pairwise setups never stall on
    // unrelated peers.
    let first = hello_rx
      .recv()
      .map_err(|_| CoupleError::Transport(format!("no requester arrived on {key}")))?;
    let size = first.size;
    let mut pending: Vec<Option<Endpoint>> = (0..size).map(|_| None).collect();
    let mut store = |hello: Hello| -> Result<()> {
      if hello.size != size || hello.rank >= size {
        return Err(CoupleError::Transport(format!(
          "inconsistent requester group on {key}: rank {} of {}",
          hello.rank, hello.size
        )));
      }
      let slot = &mut pending[hello.rank];
      if slot.is_some() {
        return Err(CoupleError::AlreadyConnected(format!("{key} rank {}", hello.rank)));
      }
      *slot = Some(Endpoint { tx: hello.to_requester, rx: hello.from_requester });
      let _ = hello.ack.send(());
      Ok(())
    };
    store(first)?;
    for _ in 1..size {
      let hello = hello_rx
        .recv()
        .map_err(|_| CoupleError::Transport(format!("requester group on {key} broke up")))?;
      store(hello)?;
    }

    self.endpoints = pending.into_iter().map(|e| e.expect("all ranks arrived")).collect();
    self.network.mark_connected(&key);
    self.connected = true;
    trace!(%key, size, "accepted connection");
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
    let key = ChannelNetwork::key(acceptor, requester);
    let hello_tx = self.network.requester_slot(&key)?;

    let (to_requester_tx, to_requester_rx) = unbounded();
    let (from_requester_tx, from_requester_rx) = unbounded();
    let (ack_tx, ack_rx) = unbounded();
    hello_tx
      .send(Hello {
        rank: own_rank,
        size: own_size,
        to_requester: to_requester_tx,
        from_requester: from_requester_rx,
        ack: ack_tx,
      })
      .map_err(|_| CoupleError::Transport(format!("acceptor vanished on {key}")))?;
    ack_rx
      .recv()
      .map_err(|_| CoupleError::Transport(format!("acceptor never acknowledged {key}")))?;

    // The requester addresses the single acceptor as remote rank 0.
    self.endpoints = vec![Endpoint { tx: from_requester_tx, rx: to_requester_rx }];
    self.connected = true;
    trace!(%key, own_rank, "requested connection");
    Ok(())
  }

  fn close_connection(&mut self) -> Result<()> {
    ensure_connected(self.connected, "channel endpoint")?;
    self.pending.check_drained()?;
    self.endpoints.clear();
    self.connected = false;
    Ok(())
  }

  fn send_f64s(&self, items: &[f64], to: Rank) -> Result<()> {
    self.push(Msg::F64s(items.to_vec()), to)
  }

  fn send_f64(&self, item: f64, to: Rank) -> Result<()> {
    self.push(Msg::F64(item), to)
  }

  fn send_usizes(&self, items: &[usize], to: Rank) -> Result<()> {
    self.push(Msg::Usizes(items.to_vec()), to)
  }

  fn send_usize(&self, item: usize, to: Rank) -> Result<()> {
    self.push(Msg::Usize(item), to)
  }

  fn send_bool(&self, item: bool, to: Rank) -> Result<()> {
    self.push(Msg::Bool(item), to)
  }

  fn recv_f64s(&self, len: usize, from: Rank) -> Result<Vec<f64>> {
    match self.pull(from)? {
      Msg::F64s(values) => {
        if values.len() != len {
          return Err(CoupleError::SizeMismatch { expected: len, got: values.len() });
        }
        Ok(values)
      }
      other => Err(Self::unexpected(&other, "f64 array")),
    }
  }

  fn recv_f64(&self, from: Rank) -> Result<f64> {
    match self.pull(from)? {
      Msg::F64(value) => Ok(value),
      other => Err(Self::unexpected(&other, "f64")),
    }
  }

  fn recv_usizes(&self, len: usize, from: Rank) -> Result<Vec<usize>> {
    match self.pull(from)? {
      Msg::Usizes(values) => {
        if values.len() != len {
          return Err(CoupleError::SizeMismatch { expected: len, got: values.len() });
        }
        Ok(values)
      }
      other => Err(Self::unexpected(&other, "usize array")),
    }
  }

  fn recv_usize(&self, from: Rank) -> Result<usize> {
    match self.pull(from)? {
      Msg::Usize(value) => Ok(value),
      other => Err(Self::unexpected(&other, "usize")),
    }
  }

  fn recv_bool(&self, from: Rank) -> Result<bool> {
    match self.pull(from)? {
      Msg::Bool(value) => Ok(value),
      other => Err(Self::unexpected(&other, "bool")),
    }
  }

  fn start_send_f64s(&self, items: &[f64], to: Rank) -> Result<SendTicket> {
    // The payload is copied into the channel, so the caller's buffer is
    // reusable the moment this returns.
    self.push(Msg::F64s(items.to_vec()), to)?;
    Ok(SendTicket::Immediate)
  }

  fn pending(&self) -> &PendingRequests {
    &self.pending
  }
}

/// Factory producing channel endpoints that share one network.
pub struct ChannelCommunicationFactory {
  network: ChannelNetwork,
}

impl ChannelCommunicationFactory {
  pub fn new(network: ChannelNetwork) -> Self {
    Self { network }
  }
}

impl CommunicationFactory for ChannelCommunicationFactory {
  fn new_communication(&self) -> Box<dyn Communication> {
    Box::new(ChannelCommunication::new(self.network.clone()))
  }
}

#[cfg(test)]
#[path = "channel_test.rs"]
mod channel_test;
