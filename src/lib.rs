//! # tekscope-rs
//!
//! Mirror a Tektronix MSO oscilloscope into a store of named values and
//! publish its waveforms as they are acquired.
//!
//! ## Features
//!
//! - **Single-session transport**: every exchange with the scope is serialized
//!   through one lock, including definite-length binary block reads
//! - **Batched settings sync**: the whole command table is read in one combined
//!   query and only changed values are published
//! - **Trigger tracking**: acquisition counter polling with lost-event counts and
//!   escalation after repeated bus failures
//! - **Waveforms in engineering units**: curves are scaled and summarized with
//!   `polars`
//! - **Built-in simulator**: `SIM::<model>` resources talk to an in-process MSO
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tekscope_rs::{connector, MemoryStore, PollCycle, RunState, ScopeConfig, ValueStore};
//!
//! let store: Arc<dyn ValueStore> = Arc::new(MemoryStore::new());
//! let config = ScopeConfig::default().with_resource("TCPIP::192.168.1.100::5025::SOCKET");
//! let (ctx, _simulator) = connector::connect(config, store)?;
//!
//! ctx.control.set_state(RunState::Started);
//! PollCycle::new(ctx).run()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Simulated scope
//!
//! ```rust
//! use std::sync::Arc;
//! use tekscope_rs::{connector, MemoryStore, PollCycle, ScopeConfig, Value, ValueStore};
//!
//! let store = Arc::new(MemoryStore::new());
//! let config = ScopeConfig::default().with_resource("SIM::MSO58").with_channels(2);
//! let (ctx, _simulator) = connector::connect(config, store.clone())?;
//!
//! PollCycle::new(ctx).startup()?;
//! assert_eq!(store.current_value("c01VoltsPerDiv"), Some(Value::Float(0.1)));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod command_map;
pub mod config;
pub mod connector;
pub mod poll_cycle;
pub mod settings;
pub mod setters;
pub mod simulator;
pub mod transport;
pub mod trigger_monitor;
pub mod value_store;
pub mod waveform;

// Re-export the main types for convenience
pub use command_map::{ChannelIndex, CommandDescriptor, CommandMap, CommandMapError, Mode, Setter};

pub use config::{ScopeConfig, ScopeContext};

pub use connector::{ConnectorError, Resource};

pub use poll_cycle::{ElapsedTimeLedger, PollCycle, PollError, RunState, ServerControl, Stage};

pub use settings::{ScopeCalibration, SettingsSynchronizer, SyncError};

pub use setters::{SetterDispatcher, SetterError};

pub use simulator::{Fault, SimHandle, SimulatedScope};

pub use transport::{BlockError, Link, Transport, TransportError};

pub use trigger_monitor::{MonitorError, TriggerEpoch, TriggerMonitor, TriggerOutcome};

pub use value_store::{MemoryStore, PublishMode, Value, ValueKind, ValueStore};

pub use waveform::{AcquireError, ByteOrder, WaveformAcquirer, WaveformError, WaveformStats};
