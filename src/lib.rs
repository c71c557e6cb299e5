pub mod config;
pub mod correlator;
pub mod daemon;
pub mod decoder;
pub mod error;
pub mod event;
pub mod notice;
pub mod shutdown;
pub mod slack;
pub mod tailer;
