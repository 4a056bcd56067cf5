//! MQTT side of the fleet client.
//!
//! ```text
//! mqtt/
//! ├── codec.rs           - camelCase <-> snake_case JSON translation
//! ├── config.rs          - broker config and address parsing
//! ├── link.rs            - transport seam and the rumqttc-backed link
//! ├── message_manager.rs - bounded log of sent/received/system entries
//! ├── mqtt_handler.rs    - public handle to the session task
//! ├── session.rs         - session actor and connection state machine
//! └── topics.rs          - topic building and parsing
//! ```
//!
//! The session task is the only owner of connection state. Everything else
//! talks to it through [`mqtt_handler::MqttHandle`].

pub mod codec;
pub mod config;
pub mod link;
pub mod message_manager;
pub mod mqtt_handler;
pub mod session;
pub mod topics;
