//! Concurrent command-multiplexing core for driving a Chromium instance over
//! the Chrome DevTools Protocol (CDP).
//!
//! A single [`manager::Manager`] task owns one [`connection::Connection`] to
//! the browser and multiplexes commands from many independent [`tab::Tab`]
//! handles over it, demultiplexing events back to whichever tab they belong
//! to. See `DESIGN.md` for how each piece is grounded.
//!
//! ```no_run
//! use cdp_core::{config::Config, manager, protocol::TabOptions, tab::Tab};
//!
//! # async fn run() -> Result<(), cdp_core::error::CdpError> {
//! let config = Config::builder().address("localhost:9222").max_tabs(8).build()?;
//! let (handle, _join) = manager::spawn(config).await?;
//! let tab = Tab::create(&handle, TabOptions::default()).await?;
//! tab.goto("https://example.com").await?;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod fetch;
pub mod manager;
pub mod protocol;
pub mod tab;
pub mod types;

pub use config::Config;
pub use error::{CdpError, ErrorKind};
pub use manager::ManagerHandle;
pub use tab::Tab;
