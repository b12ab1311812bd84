//! Traffic-mediation engine.
//!
//! Sits between an instrumented browser and origin servers: stamps every
//! exchange with a process-unique id and a monotonic display sequence,
//! applies ordered match-and-replace rules, parks exchanges awaiting
//! operator decisions, and routes capture events to the operator channel.
//! Transport (the WebSocket) and persistence (the project store) live in
//! the `console` crate; the browser itself lives in `browser-driver`.

pub mod coordinator;
pub mod driver;
pub mod error;
pub mod events;
pub mod exchange;
pub mod exclusion;
pub mod ids;
pub mod project;
pub mod replay;
pub mod rewrite;
pub mod router;

pub use coordinator::{CoordinatorConfig, HistoryRecord, InterceptionCoordinator};
pub use error::{MediatorError, Result};
pub use events::{Ack, Command, ExchangeEdit, ExchangeEvent, Notice, OutboundMessage, ReplayOutcome};
pub use exchange::{Exchange, ExchangeState, Header, HeaderList, ResponseRecord};
pub use exclusion::{is_excluded, ExclusionMatcher, ExclusionRule};
pub use ids::IdAllocator;
pub use project::{Project, RepeaterTab};
pub use replay::{parse_raw_request, ParsedRequest, ReplayExecutor};
pub use rewrite::{MatchReplaceRule, RewriteEngine, RewriteScope};
pub use router::OperatorRouter;
