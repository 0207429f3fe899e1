pub mod health;
pub mod length;
pub mod metrics;
pub mod stream;
pub mod warm;
