pub mod flash_sale;
pub mod session;
pub mod tool;
pub mod trace;
pub mod user;
