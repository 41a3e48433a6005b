//! tandem_core - engine for lock-step coupling of partitioned simulations
//!
//! Two or more independently written solvers exchange discrete field data
//! at a shared interface mesh and advance in lock-step under a configured
//! coupling algorithm. This crate provides the engine behind that:
//!
//! - **com**: synchronous channel/socket transports and the master/slave
//!   collectives inside one participant
//! - **mesh**: interface meshes, data fields, and the parallel distribution
//!   step (global indices, offsets, owner election)
//! - **m2n**: the two-channel fabric between two participants
//!   (master control channel plus gather-scatter or point-to-point
//!   distributed channels)
//! - **cplscheme**: explicit/implicit bilateral schemes, the
//!   multi-participant controller scheme, and the compositional scheduler
//! - **acceleration**: fixed-point acceleration of implicit iterations,
//!   from constant relaxation to multi-vector quasi-Newton
//!
//! The engine spawns no threads of its own; every rank of every
//! participant drives its `initialize` / `advance` / `finalize` sequence
//! and blocks inside the explicit communication points.

pub mod acceleration;
pub mod com;
pub mod config;
pub mod constants;
pub mod cplscheme;
pub mod error;
pub mod ids;
pub mod m2n;
pub mod mesh;

pub use error::{CoupleError, Result};
pub use ids::{DataId, IdAllocator, MeshId, Rank};

// Communication fabric
pub use com::{
  ChannelCommunication, ChannelCommunicationFactory, ChannelNetwork, Communication,
  CommunicationFactory, IntraComm, PtrCommunication, SocketCommunication,
  SocketCommunicationFactory,
};
pub use m2n::{DistributedCommunication, DistributedFactory, M2N};

// Meshes and data
pub use mesh::{Data, Mesh, PtrData, PtrMesh};

// Coupling schemes
pub use cplscheme::{
  Action, Arrangement, BilateralCouplingScheme, CompositionalCouplingScheme, ConvergenceMeasure,
  CouplingScheme, DataMap, Mode, MultiCouplingScheme, SimulationState,
};
pub use cplscheme::bilateral::BilateralConfig;
pub use cplscheme::multi::MultiConfig;

// Acceleration
pub use acceleration::{
  Acceleration, AitkenAcceleration, ConstantRelaxation, IqnIlsAcceleration, IqnImvjAcceleration,
  ManifoldMapping, ParallelMatrixOperations,
};
pub use acceleration::iqn_ils::QuasiNewtonSettings;

// Configuration surface
pub use config::{
  AccelerationConfig, AccelerationKind, ConvergenceMeasureConfig, ConvergenceMeasureKind,
  CouplingSchemeConfig, DistributionKind, ExchangeConfig, M2nConfig, SchemeKind, TransportKind,
};
