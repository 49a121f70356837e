//! hive supervisor - session registry, module channel server and hotkey routing
//!
//! This crate provides the core infrastructure for the `hived` binary:
//! - `registry` - Session registry actor, sole owner of session state
//! - `server` - Channel server accepting injected module connections
//! - `supervisor` - Scan, injection and refresh loop tying the injector to the registry
//! - `hotkeys` - Routes pressed chords to a session or a global action
//! - `config` - TOML configuration
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        hived                                │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐  inject  ┌──────────────────────────┐  │
//! │  │   Supervisor    │─────────▶│  Injector (hive-inject)  │  │
//! │  │ (scan, hotkeys) │          └──────────────────────────┘  │
//! │  └────────┬────────┘                                        │
//! │           │ register / reap / unload                        │
//! │           ▼                                                 │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐    │
//! │  │  ChannelServer  │────▶│     RegistryActor           │    │
//! │  │ (socket / pipe) │     │  (session state owner)      │    │
//! │  └────────┬────────┘     └──────────────┬──────────────┘    │
//! │           │ connections                 │ events            │
//! │           ▼                             ▼                   │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐    │
//! │  │ConnectionHandler│     │   broadcast::Sender         │    │
//! │  │  (per module)   │     │   (tray, status display)    │    │
//! │  └─────────────────┘     └─────────────────────────────┘    │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod config;
pub mod hotkeys;
pub mod registry;
pub mod server;
pub mod supervisor;
