pub mod answer;
pub mod ask;
pub mod cache;
