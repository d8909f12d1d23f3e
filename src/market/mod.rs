//! Market prices: lookup trait, shared price book, OKX REST and WebSocket feeds.

mod feed;
mod okx;
mod prices;

pub use feed::{MarkPriceFeed, OKX_PUBLIC_WS};
pub use okx::OkxClient;
pub use prices::{PriceBook, PriceLookup, PriceSnapshot};
