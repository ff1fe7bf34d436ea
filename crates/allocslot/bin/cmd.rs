pub mod resolve;
pub mod run;
pub mod slots;
