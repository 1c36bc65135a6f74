//! # luci-client
//!
//! Async Rust client for LUCI-style services that exchange JSON headers and
//! binary attachments over one TCP stream.
//!
//! ## Architecture
//!
//! - **Transport**: [`MixedStream`](transport::MixedStream) reads lines and
//!   exact byte counts through one reusable buffer; a bounded
//!   [`ConnectionPool`](transport::ConnectionPool) keeps connections open.
//! - **Protocol**: [`Message`] frames a [`Header`] value tree plus
//!   content-addressed [`Attachment`]s and decodes the answer state.
//!
//! ## Example
//!
//! ```ignore
//! use luci_client::{Attachment, Client, Header, Message};
//!
//! #[tokio::main]
//! async fn main() -> luci_client::Result<()> {
//!     let client = Client::builder().connect("localhost", 7654).await?;
//!
//!     let mesh = Attachment::from_bytes("obj", std::fs::read("mesh.obj")?);
//!     let mut request = Message::new(
//!         Header::new().with("run", "Mesh.Upload").with("input", mesh),
//!     );
//!     let answer = client.send_and_receive(&mut request).await?.into_result()?;
//!     println!("{answer}");
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod protocol;
pub mod transport;

mod calls;
mod client;

pub use calls::{GeoRef, ScenarioInfo};
pub use client::{Client, ClientBuilder};
pub use error::{LuciError, Result};
pub use protocol::{Attachment, CodecConfig, Header, Message, State, Value};
