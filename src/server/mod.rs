//! Server side of channel subscriptions.
//!
//! Channel-owning code registers a [`Channel`] per pattern on a [`Router`]
//! at startup and hands it to a [`ChannelServer`]. For every subscribe the
//! server runs access, then load, then installs the channel's filter:
//!
//! ```text
//! Received -> Checking -> Denied
//!                      -> Authorized -> Loading -> Delivered (live)
//! ```
//!
//! Every action produced afterwards goes through [`ChannelServer::process`],
//! which asks the channels' `resend` for target channel names and queues the
//! action for each live subscriber whose filter accepts it.
//!
//! # Example
//!
//! ```ignore
//! let mut router = Router::new();
//! router.register("users/:id", UserChannel::new(db))?;
//! let server = ChannelServer::new(router, ServerConfig::default());
//!
//! let conn = server.connect(ClientId::new("c1"), Some("u1".into()));
//! server.handle(&conn.client_id, message)?;
//!
//! server.process(&ActionContext::server(), &action, &meta);
//! ```

mod channel;
mod live;
mod manager;
mod router;

pub use channel::{ActionContext, ActionFilter, Channel, SubscribeContext};
pub use manager::{ChannelServer, ClientConnection, ServerConfig, ServerStats};
pub use router::{ChannelPattern, Route, RouteMatch, Router};
