//! OpenVPN Client Engine
//!
//! This crate runs an [`ovpn_protocol::SessionProxy`] on tokio so that CLI
//! and GUI applications only deal with configuration, events and a packet
//! channel.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Application Layer                        │
//! │        TUN device owner, UI, credential storage            │
//! │                           │                                 │
//! │           TunnelHandle    │    VpnEvent                     │
//! │                           ▼                                 │
//! │  ┌────────────────────────────────────────────────────────┐ │
//! │  │                   ovpn-engine                          │ │
//! │  │  - VpnEngine (actor loop, reconnects)                  │ │
//! │  │  - Config (TOML configuration)                         │ │
//! │  │  - UdpLink / TcpLink (tokio sockets)                   │ │
//! │  └────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────┘
//!                           │
//!                           ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Library Layer                            │
//! │  ┌──────────────────────────────────────────────────────┐   │
//! │  │  ovpn-protocol (sans-IO)                             │   │
//! │  │  - Control channel, TLS, key method 2 auth           │   │
//! │  │  - Key expansion, data channel                       │   │
//! │  └──────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod socket;
pub mod tunnel;

pub use config::{ClientConfig, CommonConfig, Config, Proto, RemoteAddress};
pub use engine::VpnEngine;
pub use error::{Error, Result};
pub use event::{EventHandler, LogLevel, LoggingEventHandler, VpnEvent, VpnState, VpnStats};
pub use socket::{LinkEvent, LinkOptions, TcpLink, UdpLink};
pub use tunnel::{ChannelTunnel, TunnelHandle};
