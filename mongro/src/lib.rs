//! Document Database Driver
//!
//! # Examples
//!
//! Connect and read:
//!
//! ```no_run
//! use mongro::{Client, FindOptions, bson::doc};
//!
//! # async fn app() -> mongro::Result<()> {
//! let client = Client::connect_env().await?;
//!
//! let users = client.database("app").collection("users");
//!
//! let mut cursor = users
//!     .find(FindOptions {
//!         filter: Some(doc! { "active": true }),
//!         ..FindOptions::default()
//!     })
//!     .await?;
//!
//! while let Some(user) = cursor.next().await {
//!     println!("{:?}", user?);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Insert with a derived mapping:
//!
//! ```no_run
//! use mongro::{Client, Encode, Decode};
//!
//! #[derive(Encode, Decode)]
//! struct User {
//!     name: String,
//!     #[bson(rename = "visitCount", min_size)]
//!     visits: i64,
//!     #[bson(omit_empty)]
//!     nickname: Option<String>,
//! }
//!
//! # async fn app() -> mongro::Result<()> {
//! let client = Client::connect_env().await?;
//!
//! let users = client.database("app").collection("users");
//! users.insert_one(&User { name: "ada".into(), visits: 1, nickname: None }).await?;
//! # Ok(())
//! # }
//! ```

pub mod common;
mod ext;
mod io;

// Wire protocol
pub mod wire;

// Encoding
pub mod bson;

// Connection
pub mod connection;
pub mod pool;

// Deployment
pub mod topology;

// Session
pub mod session;

// Operation
mod command;
pub mod cursor;
mod dispatch;

mod client;
mod config;

mod error;

#[doc(inline)]
pub use bson::{Bson, Decode, Document, Encode, ObjectId};
#[doc(inline)]
pub use client::{Client, Collection, CursorType, Database, FindOptions, InsertResult};
#[doc(inline)]
pub use config::{Acknowledgment, Address, Config, ReadConcern, WriteConcern};
#[doc(inline)]
pub use connection::Connection;
#[doc(inline)]
pub use cursor::Cursor;
#[doc(inline)]
pub use dispatch::{ServerError, WriteConcernError};
#[doc(inline)]
pub use error::{Error, ErrorKind, Result};
#[doc(inline)]
pub use session::Session;
#[doc(inline)]
pub use topology::select::{ReadMode, ReadPreference};

#[cfg(feature = "macros")]
pub use mongro_macros::{Decode, Encode};
