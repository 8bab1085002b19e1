pub mod backoff;
pub mod feed;
pub mod frames;
pub mod transport;

pub use backoff::ReconnectPolicy;
pub use feed::{
    periodic_resync, FeedConfig, FeedEvent, FeedHandle, StreamingFeed, SubscriptionDelta,
    SubscriptionSet,
};
pub use frames::{Channel, StreamEvent};
pub use transport::{TungsteniteConnector, WsConnection, WsConnector};
