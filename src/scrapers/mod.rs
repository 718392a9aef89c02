pub mod market_data; // Collaborator trait: daily closes + trading-date calendar source
pub mod stooq; // Stooq end-of-day CSV client

pub use market_data::{DailyClose, MarketData};
pub use stooq::StooqClient;
