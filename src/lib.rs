// Copyright 2020 Joyent, Inc.

//! FCP: a line-oriented client protocol for submitting and tracking content
//! fetch and insert jobs.
//!
//! Protocol definition
//!
//! Every message is a type name line, a body of `Key=Value` lines and an end
//! marker:
//!
//! ```text
//! ClientGet
//! Identifier=job1
//! URI=KSK@test.txt
//! Verbosity=1
//! End
//! ```
//!
//! * Keys containing `.` address nested field sets, so `Files.0.Name=a`
//!   lives under `Files` → `0` → `Name`.
//!
//! * `End` closes a simple message. `Data` closes a message carrying a
//!   binary payload; exactly `DataLength` raw bytes follow the marker.
//!
//! * The first message on a connection must be `ClientHello` with `Name`
//!   and `ExpectedVersion`. Anything else first is a fatal protocol error.
//!
//! Requests are named by a client-chosen `Identifier`, unique per client,
//! and live in one of three persistence tiers:
//!
//! * `connection`  the request dies with the connection that submitted it.
//!
//! * `reboot`      the request survives reconnects; a new connection with
//!                 the same client name sees it again.
//!
//! * `forever`     the request is written to the persistent request file and
//!                 restored after a restart.
//!
//! Requests with `Global=true` live on the global queue, which any client
//! can watch with `WatchGlobal`.

#![allow(missing_docs)]

pub mod bucket;
pub mod client;
pub mod config;
pub mod connection;
pub mod engine;
pub mod errors;
pub mod fieldset;
pub mod manager;
pub mod message;
pub mod protocol;
pub mod request;
pub mod server;
pub mod session;
pub mod store;
