pub mod lead;
pub mod message;
pub mod order;
