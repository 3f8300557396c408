//! # MQTT Session Module
//!
//! Owns the one MQTT session of the demo: connecting to the broker, subscribing
//! to the configured topic, publishing text to it and collecting whatever
//! arrives there. The UI only issues commands and watches the published state.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs           - SessionConfig snapshot (endpoint, credentials, TLS)
//! ├── error.rs            - Transport error taxonomy
//! ├── message_manager.rs  - Received message entries and the newest-first log
//! ├── mqtt_handler.rs     - ConnectionState machine and SessionManager
//! └── transport.rs        - Transport traits and the rumqttc adapter
//! ```
//!
//! ## Data Flow
//!
//! ```text
//! UI ──configure/connect/disconnect/publish──► SessionManager ──► Transport (rumqttc)
//!  ▲                                                │                   │
//!  └──── watch<ConnectionState>, watch<MessageLog> ◄┴── SessionEvent ◄──┘
//! ```
//!
//! ## Failure Handling
//!
//! Commands never return errors. A command that does not fit the current state
//! is logged and dropped. Connect failures and lost links show up as
//! `ConnectionState::Failed`. Publish, subscribe and close failures are only
//! logged. Disconnect is optimistic: the state is `Disconnected` as soon as the
//! call returns.

pub mod config;
pub mod error;
pub mod message_manager;
pub mod mqtt_handler;
pub mod transport;
