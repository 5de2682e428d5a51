//! Observability for the registry: rotating log files ([`log`]), the
//! persistent error ledger ([`ledger`]) and the in-process message bus
//! ([`bus`]).

pub mod bus;
pub mod error;
pub mod ledger;
pub mod log;

pub use crate::bus::{CommunicationManager, ConnectionId, ConnectionManager, Message};
pub use crate::ledger::{ErrorManager, ErrorQuery, ErrorRecord, ErrorReport, Severity};
pub use crate::log::{Level, LogManager, Logger, LoggerOptions};
