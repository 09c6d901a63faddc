pub mod client_handle;
pub mod client_session;
pub mod codec;
pub mod connection;
pub mod dispatch;
pub mod framing;
pub mod messages;
pub mod outbox;
pub mod protocol;
pub mod queue;
pub mod runner;
pub mod server_handle;
pub mod server_session;
pub mod transport;
