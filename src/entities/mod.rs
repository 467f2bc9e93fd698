pub mod inventory_level;
pub mod product;
pub mod sale;
pub mod sale_line;
pub mod stock_movement;
