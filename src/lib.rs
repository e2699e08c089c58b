//! Omni-channel inbound message ingestion for WhatsApp, Messenger, Instagram
//! and the embeddable web widget.

pub mod ai;
pub mod app;
pub mod config;
pub mod contacts;
pub mod conversations;
pub mod error;
pub mod graph;
pub mod media;
pub mod normalize;
pub mod prompting;
pub mod realtime;
pub mod signature;
pub mod store;
pub mod types;
pub mod webhook;
pub mod widget;
