pub mod bus;
pub mod envelope;
pub mod errors;
pub mod events;
pub mod ids;
pub mod settings;
pub mod state;

pub use bus::{EventBus, Listener, SubscriptionId};
pub use envelope::{decode, encode, Envelope, EnvelopeError};
pub use errors::{LinkError, TransportError};
pub use events::{ChannelKind, EventKind, TransportEvent};
pub use ids::ConnectionId;
pub use settings::{DualinkSettings, LoggingSettings, SettingsError, TransportSettings};
pub use state::{CloseReason, CloseSource, ConnectionState};
