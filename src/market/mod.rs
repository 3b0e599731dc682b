pub mod backend;
pub mod binance;
pub mod candles;
pub mod clock;
pub mod gate;
pub mod persistence;
pub mod scheduler;
pub mod session;
pub mod sources;
pub mod types;
pub mod window;
