pub mod health;
pub mod receipts;
pub mod summarize;
