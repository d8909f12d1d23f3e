//! Ledger records (balance, holdings, orders, trades, realized P&L) and
//! request types.

mod balance;
mod holding;
mod order;
mod pnl;
mod request;

pub use balance::{Balance, BALANCE_CURRENCY};
pub use holding::{direction_of, is_dust, Direction, Holding};
pub use order::{Order, OrderStatus, Side, Trade};
pub use pnl::RealizedPnlEntry;
pub use request::{
    normalize_instrument, parse_decimal, CloseOrderForm, CloseRequest, OpenOrderForm,
    OpenRequest, SizeMode,
};
