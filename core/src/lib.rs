//! CareChat core - real-time chat for the maternal-health care portal
//!
//! Conversation inbox, per-conversation message history, live delivery over
//! a single push channel, de-duplication and reconnection.

pub mod api;
pub mod chat_types;
pub mod cli_app;
pub mod config;
pub mod conversation_directory;
pub mod error;
pub mod facade;
pub mod message_store;
pub mod transport;
pub mod utils;

pub use api::{ChatApi, HttpChatApi, SharedToken, TokenProvider};
pub use chat_types::{ChatEvent, Conversation, ConversationId, DeliveryState, Message, MessageId};
pub use config::Config;
pub use conversation_directory::{ConversationDirectory, DirectorySnapshot};
pub use error::{ChatError, Result};
pub use facade::ChatFacade;
pub use message_store::{FetchOutcome, Merge, MessageStore, ThreadSnapshot};
pub use transport::{ConnectionState, ConnectionStatus, TransportConnection};
