pub mod operation;
pub mod upload;
