pub mod audit;
pub mod emergency;
pub mod policies;
pub mod serve;
pub mod state;
