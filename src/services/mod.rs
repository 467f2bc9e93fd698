// Core services
pub mod inventory;
pub mod sales;
