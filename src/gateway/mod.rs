//! Exchange Gateway (C1): priority-aware REST facade, symbol metadata cache,
//! clock sync, local order validation, and the margin-mode/leverage/margin
//! affordability preamble every order-creating call must pass through.

pub mod client;
pub mod clock;
pub mod metadata;

pub use client::{Gateway, NewOrderRequest, WsConnectInfo};
pub use clock::ClockSync;
pub use metadata::MetadataCacheHandle;
