// Risk alert domain
pub mod alert;
