// src/lib.rs
pub mod ports {
    pub mod exchange;
    pub mod price_feed;
    pub mod replay_feed;
}
pub mod trade {
    pub mod execution {
        pub mod binance_futures;
        pub mod exchange_box;
    }
}
pub mod clock;
pub mod config;
pub mod dispersion;
pub mod documents;
pub mod edge_stop;
pub mod error;
pub mod executor;
pub mod logger;
pub mod risk;
pub mod signal;
pub mod status;
