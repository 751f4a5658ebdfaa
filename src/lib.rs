//! `ptybridge` — a relay bridging a local, PTY-hosted AI coding assistant to
//! a legacy Unix client over a multiplexed TCP protocol.
//!
//! Module layout mirrors the component table: [`wire`] and [`error`] are the
//! leaves; [`flow`] and [`stream`] build on them; [`session`] ties the
//! transport together; [`ops`] is the typed operation engine; [`pty`] and
//! [`host`] are the two OS-facing gateways; [`dispatcher`] is the local
//! tool-calling HTTP surface.

pub mod dispatcher;
pub mod error;
pub mod flow;
pub mod host;
pub mod ops;
pub mod pty;
pub mod session;
pub mod stream;
pub mod wire;
