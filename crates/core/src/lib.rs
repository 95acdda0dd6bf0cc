pub mod clock;
pub mod envelope;
pub mod error;
pub mod expr;
pub mod fingerprint;
pub mod ids;
pub mod mapping;
pub mod path;
pub mod reference;

pub use clock::{Clock, ManualClock, SystemClock, Version, VersionClock};
pub use envelope::{ChangeEnvelope, Envelope, EnvelopeInput, WebhookPayload};
pub use error::CoreError;
pub use fingerprint::PayloadHash;
pub use ids::*;
pub use mapping::MappingDocument;

/// A local row or a global payload: a JSON object keyed by field name.
pub type Row = serde_json::Map<String, serde_json::Value>;
