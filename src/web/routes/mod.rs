// Route handler modules

pub mod health;
pub mod models;
pub mod props;
pub mod proxy;
