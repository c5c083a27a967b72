//! Conversation pipeline.
//!
//! Every contact message flows through:
//! 1. `InboundCoordinator`: admission, ordering, batching
//! 2. `ResponseGenerator`: the reply
//! 3. `OutboundDeliverer`: deduplicated, retried delivery
//! 4. `PersistenceLedger`: write-behind storage
//!
//! `Services` builds these once and owns their background tasks.

pub mod processor;
pub mod responder;
pub mod services;
pub mod stage;

pub use processor::{ConversationPipeline, ExchangeReport, HandleOutcome};
pub use responder::{EchoResponder, GeneratedResponse, ResponseGenerator};
pub use services::Services;
pub use stage::Stage;
