//! Synchronous point-to-point communication between two process groups.
//!
//! A [`Communication`] endpoint connects one local process to a remote group
//! of processes. Connection setup is asymmetric: one side calls
//! `accept_connection`, the other `request_connection`; afterwards the
//! acceptor addresses requesters by their rank and every requester addresses
//! the acceptor as rank 0.
//!
//! Sending methods prefixed with `a` are asynchronous: they return a request
//! handle immediately and the transfer is guaranteed complete only after
//! `wait()`. Their value is deterministic non-blocking behavior, which the
//! cyclic quasi-Newton matrix product relies on to stay deadlock-free.
//! Requests left un-waited when the channel closes surface as
//! [`CoupleError::PendingRequest`].

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{CoupleError, Result};
use crate::ids::Rank;

pub mod channel;
pub mod intra;
pub mod socket;

pub use channel::{ChannelCommunication, ChannelCommunicationFactory, ChannelNetwork};
pub use intra::IntraComm;
pub use socket::{SocketCommunication, SocketCommunicationFactory};

/// Shared handle to a communication endpoint.
pub type PtrCommunication = Rc<RefCell<dyn Communication>>;

/// One synchronous endpoint towards a remote communicator.
pub trait Communication {
  /// Returns true once connection setup has completed.
  fn is_connected(&self) -> bool;

  /// Number of processes in the remote communicator.
  fn remote_size(&self) -> usize;

  /// Waits for all requesters of the named connection to arrive.
  fn accept_connection(&mut self, acceptor: &str, requester: &str) -> Result<()>;

  /// Connects to an acceptor, identifying as `own_rank` of `own_size`.
  fn request_connection(
    &mut self,
    acceptor: &str,
    requester: &str,
    own_rank: Rank,
    own_size: usize,
  ) -> Result<()>;

  /// Tears the connection down. Fails with `PendingRequest` if asynchronous
  /// requests are still outstanding.
  fn close_connection(&mut self) -> Result<()>;

  fn send_f64s(&self, items: &[f64], to: Rank) -> Result<()>;
  fn send_f64(&self, item: f64, to: Rank) -> Result<()>;
  fn send_usizes(&self, items: &[usize], to: Rank) -> Result<()>;
  fn send_usize(&self, item: usize, to: Rank) -> Result<()>;
  fn send_bool(&self, item: bool, to: Rank) -> Result<()>;

  fn recv_f64s(&self, len: usize, from: Rank) -> Result<Vec<f64>>;
  fn recv_f64(&self, from: Rank) -> Result<f64>;
  fn recv_usizes(&self, len: usize, from: Rank) -> Result<Vec<usize>>;
  fn recv_usize(&self, from: Rank) -> Result<usize>;
  fn recv_bool(&self, from: Rank) -> Result<bool>;

  /// Starts an asynchronous send. The returned ticket resolves once the
  /// payload has been handed to the transport and may be waited on.
  fn start_send_f64s(&self, items: &[f64], to: Rank) -> Result<SendTicket>;

  /// Counter of outstanding asynchronous requests on this endpoint.
  fn pending(&self) -> &PendingRequests;
}

impl<'c> dyn Communication + 'c {
  /// Asynchronously sends an array of doubles.
  pub fn asend_f64s(&self, items: &[f64], to: Rank) -> Result<Request<'_>> {
    let ticket = self.start_send_f64s(items, to)?;
    self.pending().begin();
    Ok(Request { com: self, ticket: Some(ticket) })
  }

  /// Asynchronously receives an array of doubles. The receive itself is
  /// deferred until `wait()`, which keeps the issuing call non-blocking.
  pub fn arecv_f64s(&self, len: usize, from: Rank) -> RecvRequest<'_> {
    self.pending().begin();
    RecvRequest { com: self, from, len }
  }
}

/// Transport-side completion of an asynchronous send.
///
/// `Immediate` is used by transports that copy the payload before returning;
/// `Deferred` carries the completion signal of a background writer.
pub enum SendTicket {
  Immediate,
  Deferred(crossbeam_channel::Receiver<Result<()>>),
}

/// Handle of an asynchronous send; `wait` blocks until the payload buffer
/// may be reused.
pub struct Request<'a> {
  com: &'a dyn Communication,
  ticket: Option<SendTicket>,
}

impl Request<'_> {
  pub fn wait(mut self) -> Result<()> {
    self.com.pending().finish();
    match self.ticket.take() {
      None | Some(SendTicket::Immediate) => Ok(()),
      Some(SendTicket::Deferred(done)) => done
        .recv()
        .map_err(|_| CoupleError::Transport("async send lost its writer".into()))?,
    }
  }
}

/// Handle of an asynchronous receive; `wait` blocks until the data arrived
/// and returns it.
pub struct RecvRequest<'a> {
  com: &'a dyn Communication,
  from: Rank,
  len: usize,
}

impl RecvRequest<'_> {
  pub fn wait(self) -> Result<Vec<f64>> {
    self.com.pending().finish();
    self.com.recv_f64s(self.len, self.from)
  }
}

/// Count of asynchronous requests that have not been waited on yet.
///
/// Dropping a request without waiting leaves the count raised, so
/// `close_connection` can detect the protocol violation.
#[derive(Clone, Default)]
pub struct PendingRequests(Arc<AtomicUsize>);

impl PendingRequests {
  pub fn new() -> Self {
    Self::default()
  }

  fn begin(&self) {
    self.0.fetch_add(1, Ordering::Relaxed);
  }

  fn finish(&self) {
    self.0.fetch_sub(1, Ordering::Relaxed);
  }

  /// Fails with `PendingRequest` when requests are still outstanding.
  pub fn check_drained(&self) -> Result<()> {
    if self.0.load(Ordering::Relaxed) != 0 {
      return Err(CoupleError::PendingRequest);
    }
    Ok(())
  }
}

/// Creates fresh communication endpoints, used wherever a channel per peer
/// pair is needed (point-to-point exchange, cyclic quasi-Newton ring).
pub trait CommunicationFactory {
  fn new_communication(&self) -> Box<dyn Communication>;
}

/// Guard for operations that need a live connection.
pub(crate) fn ensure_connected(connected: bool, what: &str) -> Result<()> {
  if !connected {
    return Err(CoupleError::NotConnected(what.to_string()));
  }
  Ok(())
}
