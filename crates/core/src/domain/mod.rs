pub mod approval;
pub mod document;
pub mod workflow;
